use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Notifications delivered to the host. Every method defaults to a no-op.
///
/// `on_segment_switch` runs on the render thread: keep it short (hand heavy work such as uploads
/// to another thread, e.g. via `ChannelCallback`).
pub trait RecordCallback: Send + Sync {
    fn on_record_start(&self, _session: &str) {}
    fn on_record_stop(&self, _session: &str) {}
    /// `completed` is the file that was just finalized; `new_index` the segment now being written.
    fn on_segment_switch(&self, _session: &str, _new_index: u32, _completed: &Path) {}
}

/// Callback that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl RecordCallback for NoopCallback {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    RecordStarted { session: String },
    RecordStopped { session: String },
    SegmentSwitched {
        session: String,
        new_index: u32,
        completed_path: PathBuf,
    },
}

/// Forwards callbacks as `RecorderEvent`s over a channel.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: Sender<RecorderEvent>,
}

impl ChannelCallback {
    pub fn new() -> (Self, Receiver<RecorderEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl RecordCallback for ChannelCallback {
    fn on_record_start(&self, session: &str) {
        let _ = self.tx.send(RecorderEvent::RecordStarted {
            session: session.to_string(),
        });
    }

    fn on_record_stop(&self, session: &str) {
        let _ = self.tx.send(RecorderEvent::RecordStopped {
            session: session.to_string(),
        });
    }

    fn on_segment_switch(&self, session: &str, new_index: u32, completed: &Path) {
        let _ = self.tx.send(RecorderEvent::SegmentSwitched {
            session: session.to_string(),
            new_index,
            completed_path: completed.to_path_buf(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_callback_forwards_in_order() {
        let (cb, rx) = ChannelCallback::new();
        cb.on_record_start("s1");
        cb.on_segment_switch("s1", 1, Path::new("a.mp4"));
        cb.on_record_stop("s1");

        let got: Vec<RecorderEvent> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![
                RecorderEvent::RecordStarted { session: "s1".into() },
                RecorderEvent::SegmentSwitched {
                    session: "s1".into(),
                    new_index: 1,
                    completed_path: PathBuf::from("a.mp4"),
                },
                RecorderEvent::RecordStopped { session: "s1".into() },
            ]
        );
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (cb, rx) = ChannelCallback::new();
        drop(rx);
        cb.on_record_start("s");
    }
}
