pub mod socket;
mod addr;
mod error;
mod event;

pub use self::addr::{format_address, SockAddr};
pub use self::error::{errno, error_description, error_string, Error};
pub use self::error::{EAI_ADDRFAMILY, EAI_NODATA};
pub use self::event::{
	Callback, EventDispatcher, EventKind, EventLoop, HandlerId, SocketEvent, SocketEventHandler,
	SourceId,
};
pub use self::socket::{AddressFamily, Socket, SocketState, FLAG_KEEPALIVE, FLAG_NODELAY};
