pub mod negotiator;
pub mod session;
pub mod state;

pub use negotiator::{
    select_video_codec, CapabilityAnnouncement, CodecDescriptor, MediaKind, NegotiatedCodec,
    NegotiationError,
};
pub use session::{Session, SessionBootstrapper, SessionError};
pub use state::{ConnectionState, ConnectionStateFeed, ConnectionStateStream};

use crate::{debug, info, warn};
