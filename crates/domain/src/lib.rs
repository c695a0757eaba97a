pub mod cart;
pub mod codec;
pub mod envelope;
pub mod topics;

pub use cart::{is_valid_uuid_v4, CartDetails, CartItem};
pub use codec::{decode_event, encode_command, encode_event, CodecError};
pub use envelope::{CommandEnvelope, CommandKind, EventEnvelope, EventKind};
