/*
 * kview/api - the data model shared by the relay and its clients: resource
 * identities and bodies, status labels, composite views and the messages
 * exchanged with UI sessions.
 */

pub mod message;
pub use message::ClientRequest;
pub use message::Delta;
pub use message::ErrorReport;
pub use message::HubMessage;
pub use message::ObjectState;
pub use message::Scope;
pub use message::SessionReport;
pub use message::SessionState;
pub use message::Snapshot;
pub use message::SubscriptionFilter;

pub mod resource;
pub use resource::Condition;
pub use resource::ConditionStatus;
pub use resource::InventoryEntry;
pub use resource::ObjectKey;
pub use resource::ObjectRef;
pub use resource::ResourceKind;
pub use resource::ResourceObject;

pub mod status;
pub use status::StatusLabel;
pub use status::StatusLabelSet;

pub mod view;
pub use view::CompositeView;
pub use view::ViewMember;
