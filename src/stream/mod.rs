mod sender;
mod server;
mod throttle;
mod track;

pub use sender::{AudioConfigMessage, ClientMessage, ClientStats, STREAM_VERSION, run_client};
pub use server::StreamServer;
pub use throttle::Throttle;
pub use track::{AudioFrame, TrackAdapter};
