//! Dedicated worker for host mutations that must stay off the processing
//! thread.
//!
//! The processing context enqueues [`HostCommand`]s on an unbounded
//! channel and never waits for them; the worker executes them in order on
//! one thread. Commands are fire-and-forget, so host state observed on the
//! next quantum may be up to one quantum stale.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};

use crate::error::Result;
use crate::host::{HostTimeline, TempoMarker};

#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Play,
    Stop,
    SetEditCursor { time: f64, seek_play: bool },
    NudgeRateUp,
    NudgeRateDown,
    ResetPlayrate,
    /// Rewrite a tempo marker; falls back to an unconditional tempo set
    /// when the marker position is not addressable.
    RewriteTempoMarker(TempoMarker),
    SetTempo(f64),
    BeginUndoBlock,
    EndUndoBlock,
    UpdateTimeline,
    Shutdown,
}

pub struct HostWorker {
    sender: Sender<HostCommand>,
    thread: Option<JoinHandle<()>>,
}

impl HostWorker {
    pub fn spawn(host: Arc<dyn HostTimeline>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("tempolink-host".into())
            .spawn(move || run(host, receiver))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Sender half for the processing context. Sends never block.
    pub fn sender(&self) -> Sender<HostCommand> {
        self.sender.clone()
    }
}

impl Drop for HostWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(HostCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(host: Arc<dyn HostTimeline>, receiver: Receiver<HostCommand>) {
    debug!("host worker started");
    for command in receiver {
        trace!("host command: {command:?}");
        match command {
            HostCommand::Play => host.play(),
            HostCommand::Stop => host.stop(),
            HostCommand::SetEditCursor { time, seek_play } => {
                host.set_edit_cursor(time, seek_play)
            }
            HostCommand::NudgeRateUp => host.nudge_playrate_up(),
            HostCommand::NudgeRateDown => host.nudge_playrate_down(),
            HostCommand::ResetPlayrate => host.reset_playrate(),
            HostCommand::RewriteTempoMarker(marker) => {
                if !host.set_tempo_marker(&marker) {
                    // silent tempo divergence is worse than a coarse edit
                    debug!(
                        "tempo marker {} not addressable, falling back to global tempo set",
                        marker.index
                    );
                    host.set_tempo(marker.bpm);
                }
            }
            HostCommand::SetTempo(bpm) => host.set_tempo(bpm),
            HostCommand::BeginUndoBlock => host.begin_undo_block(),
            HostCommand::EndUndoBlock => host.end_undo_block("tempolink"),
            HostCommand::UpdateTimeline => host.update_timeline(),
            HostCommand::Shutdown => break,
        }
    }
    debug!("host worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::{HostCall, MockHost};
    use std::time::{Duration, Instant};

    fn wait_for(host: &MockHost, count: usize) -> Vec<HostCall> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let calls = host.calls();
            if calls.len() >= count {
                return calls;
            }
            assert!(Instant::now() < deadline, "worker timed out: {calls:?}");
            thread::yield_now();
        }
    }

    #[test]
    fn test_commands_execute_in_order() {
        let host = Arc::new(MockHost::new(120.0));
        let worker = HostWorker::spawn(host.clone()).unwrap();
        let sender = worker.sender();

        sender.send(HostCommand::Stop).unwrap();
        sender
            .send(HostCommand::SetEditCursor {
                time: 2.0,
                seek_play: true,
            })
            .unwrap();
        sender.send(HostCommand::Play).unwrap();

        let calls = wait_for(&host, 3);
        assert_eq!(
            calls,
            vec![
                HostCall::Stop,
                HostCall::SetEditCursor(2.0, true),
                HostCall::Play,
            ]
        );
    }

    #[test]
    fn test_marker_rewrite_falls_back_to_tempo_set() {
        let host = Arc::new(MockHost::new(120.0));
        host.state.lock().marker_write_fails = true;
        let worker = HostWorker::spawn(host.clone()).unwrap();

        let marker = host.tempo_marker(0).unwrap();
        worker
            .sender()
            .send(HostCommand::RewriteTempoMarker(TempoMarker {
                bpm: 99.0,
                ..marker
            }))
            .unwrap();

        let calls = wait_for(&host, 2);
        assert_eq!(calls[0], HostCall::SetTempoMarker(0, 99.0));
        assert_eq!(calls[1], HostCall::SetTempo(99.0));
    }

    #[test]
    fn test_drop_shuts_worker_down() {
        let host = Arc::new(MockHost::new(120.0));
        let worker = HostWorker::spawn(host.clone()).unwrap();
        let sender = worker.sender();
        drop(worker);
        // channel is disconnected once the worker is gone
        assert!(sender.send(HostCommand::Play).is_err());
    }
}
