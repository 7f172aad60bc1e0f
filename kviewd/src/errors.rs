use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /* the upstream can no longer resume from our cursor, a re-list is needed */
    #[error("resource version expired")]
    Expired,

    #[error("access denied: {0}")]
    Denied(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("giving up after {0} consecutive failures: {1}")]
    RetriesExhausted(u32, String),

    #[error("unknown cluster context `{0}`")]
    UnknownContext(String),

    #[error(transparent)]
    InvalidKind(#[from] kview_api::resource::InvalidKind),

    #[error("unable to decode object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("relay is closed")]
    Closed,
}

impl Error {

    /*
     * Terminal errors are never retried: the session (or context) is
     * unusable until the user changes something.
     */
    pub fn is_terminal(&self) -> bool {
	match self {
	    Error::Kube(kube::Error::Api(resp)) => matches!(resp.code, 401 | 403 | 404),
	    Error::Kubeconfig(_) => true,
	    Error::Denied(_) => true,
	    Error::RetriesExhausted(_, _) => true,
	    Error::UnknownContext(_) => true,
	    Error::InvalidKind(_) => true,
	    Error::Closed => true,
	    _ => false,
	}
    }

    pub fn is_expired(&self) -> bool {
	match self {
	    Error::Expired => true,
	    Error::Kube(kube::Error::Api(resp)) => resp.code == 410,
	    _ => false,
	}
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
