use std::time::Duration;

use crate::message::Envelope;

/// Out-of-band capture of a room's broadcast traffic. Calls are fire-and-forget, so
/// implementations should hand the envelope off quickly. For example,
/// ```rust
/// use std::{sync::mpsc, time::Duration};
/// use tstream_hub::{message::Envelope, recorder::Recorder};
///
/// struct ChannelRecorder {
///   sender: std::sync::Mutex<mpsc::Sender<(String, Envelope, Duration)>>,
/// }
/// impl Recorder for ChannelRecorder {
///   fn record(&self, room: &str, envelope: &Envelope, delay: Duration) {
///     if let Ok(sender) = self.sender.lock() {
///       let _ = sender.send((room.to_owned(), envelope.clone(), delay));
///     }
///   }
/// }
/// ```
pub trait Recorder: Send + Sync {
    /// * `delay` - Offset of the envelope from the start of the room.
    fn record(&self, room: &str, envelope: &Envelope, delay: Duration);
}
