//! Client-side realtime chat core: keeps each conversation's transcript
//! consistent while local sends, backend acknowledgments and server pushes
//! arrive in any order.

pub mod api;
pub mod bus;
pub mod chat;
pub mod config;
pub mod entity;
pub mod error;
pub mod interface;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

pub use chat::{Attachment, AttachmentKind, ConversationKey, DeliveryState, Message, MessageId, Outgoing};
pub use session::{ChatSession, Subscription};
pub use store::ConversationStore;
