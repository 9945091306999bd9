//! Progress lines of long-running wallet flows. Producers only send
//! events; the single consumer folds them into a [`ProgressLog`].

use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use twallet_log::clock_time;

use crate::recovery::summary_message;

#[derive(Clone, Debug, PartialEq)]
pub enum RescanEvent {
    Line(String),
    /// Replaces the previous progress line instead of appending.
    Progress(String),
    /// The passphrase was rejected; the caller should ask again.
    PromptAgain(String),
    Completed { elapsed: Duration, utxo_count: usize },
    Failed(String),
}

#[derive(Clone)]
pub struct ProgressSink {
    tx: Sender<RescanEvent>,
}

impl ProgressSink {
    pub fn new(tx: Sender<RescanEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end for its consumer.
    pub fn channel() -> (Self, Receiver<RescanEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn line(&self, message: impl AsRef<str>) {
        self.send(RescanEvent::Line(stamp(message.as_ref())));
    }

    pub fn progress(&self, message: impl AsRef<str>) {
        self.send(RescanEvent::Progress(stamp(message.as_ref())));
    }

    pub fn send(&self, event: RescanEvent) {
        // Nobody watching is fine.
        let _ = self.tx.send(event);
    }
}

fn stamp(message: &str) -> String {
    format!("[{}] {message}", clock_time(SystemTime::now()))
}

/// Text shown in the progress view.
#[derive(Clone, Debug, Default)]
pub struct ProgressLog {
    lines: Vec<String>,
    progress_idx: Option<usize>,
    outcome: Option<String>,
}

impl ProgressLog {
    pub fn apply(&mut self, event: &RescanEvent) {
        match event {
            RescanEvent::Line(line) => {
                self.lines.push(line.clone());
                self.progress_idx = None;
            }
            RescanEvent::Progress(line) => match self.progress_idx {
                Some(idx) => self.lines[idx] = line.clone(),
                None => {
                    self.progress_idx = Some(self.lines.len());
                    self.lines.push(line.clone());
                }
            },
            RescanEvent::PromptAgain(message) | RescanEvent::Failed(message) => {
                self.outcome = Some(message.clone());
            }
            RescanEvent::Completed {
                elapsed,
                utxo_count,
            } => {
                self.outcome = Some(summary_message(*elapsed, *utxo_count));
            }
        }
    }

    /// Applies everything queued without blocking; returns how many events
    /// were consumed.
    pub fn drain(&mut self, rx: &Receiver<RescanEvent>) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            self.apply(&event);
            applied += 1;
        }
        applied
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn outcome(&self) -> Option<&str> {
        self.outcome.as_deref()
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}
