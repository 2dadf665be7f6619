mod capture;
mod device;
mod dispatcher;
mod ipc;
mod queue;
mod wav;
mod worker;

pub use capture::{CaptureManager, WorkerCommand};
pub use device::{InputDeviceInfo, list_input_devices, open_input_device, select_device};
pub use dispatcher::{ChunkCallback, DispatchStats, SubscriberRegistry, Subscription, SubscriptionId};
pub use ipc::{MAX_FRAME_BYTES, read_frame, write_frame};
pub use queue::DropOldestQueue;
pub use wav::encode as encode_wav;
pub use worker::{peak, run_worker, samples_to_bytes};

/// Decodes little-endian i16 PCM; a trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
