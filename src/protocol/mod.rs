//! Protocol module - wire framing and the command schema
//!
//! Both the control socket and the host bridge speak length-prefixed JSON;
//! control frames are validated into typed commands before execution.

pub mod codec;
pub mod command;

pub use codec::{Decoded, FrameCodec, FrameDecoder, MAX_FRAME_LEN};
pub use command::{validate, validate_str, Action, Command, ValidationError, ValidationKind};
