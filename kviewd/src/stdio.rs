use crate::errors::Error;
use crate::relay::ClientConnection;
use kview_api::{ClientRequest, ErrorReport, HubMessage, Scope};

use log;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/*
 * Serves one connection over JSON lines: hub messages are written to
 * `output`, one per line; each line read from `input` is a ClientRequest.
 *
 * While the output is writable the connection keeps itself alive, so a
 * plain pipe does not need to send heartbeats. A filter that cannot be
 * served is answered with an error line and the current subscription stays.
 * Ends when the connection is closed.
 */
pub async fn serve<R, W>(conn: &mut ClientConnection, input: R, mut output: W) -> Result<(), Error>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut input_open = true;
    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);

    loop {
	let request = tokio::select! {
	    msg = conn.recv() => {
		let Some(msg) = msg else {
		    break;
		};
		write_message(&mut output, &msg).await?;
		None
	    },
	    line = lines.next_line(), if input_open => {
		match line {
		    Ok(Some(line)) => parse_request(&line),
		    Ok(None) => {
			log::debug!("input closed, serving read only");
			input_open = false;
			None
		    },
		    Err(err) => {
			log::warn!("unable to read request: {}", err);
			input_open = false;
			None
		    },
		}
	    },
	    _ = ticker.tick() => {
		conn.heartbeat();
		None
	    },
	};

	match request {
	    Some(ClientRequest::Filter(filter)) => {
		let context = filter.context.clone();
		if let Err(err) = conn.update_filter(filter).await {
		    log::warn!("{} cannot switch to context '{}': {}", conn.id(), context, err);
		    let msg = HubMessage::Error{
			scope: Scope::context(&context),
			payload: ErrorReport{
			    message: err.to_string(),
			    terminal: true,
			},
		    };
		    write_message(&mut output, &msg).await?;
		}
	    },
	    Some(ClientRequest::Heartbeat) => conn.heartbeat(),
	    None => {},
	}
    }

    Ok(())
}

async fn write_message<W: AsyncWrite + Unpin>(output: &mut W, msg: &HubMessage) -> Result<(), Error> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    write_line(output, &line).await
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &[u8]) -> Result<(), Error> {
    output.write_all(line).await.map_err(|err| Error::Transient(err.to_string()))?;
    output.flush().await.map_err(|err| Error::Transient(err.to_string()))?;
    Ok(())
}

fn parse_request(line: &str) -> Option<ClientRequest> {
    let line = line.trim();
    if line.is_empty() {
	return None;
    }

    match serde_json::from_str(line) {
	Ok(request) => Some(request),
	Err(err) => {
	    log::warn!("ignoring malformed request {:?}: {}", line, err);
	    None
	},
    }
}
