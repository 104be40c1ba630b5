//! The render thread: capture reader -> effects graph -> processed output.
//!
//! Uses std::thread (NOT tokio tasks) so sample processing never waits on
//! the async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::capture::SampleReader;
use crate::graph::{DspGraph, RENDER_QUANTUM};

const DEFAULT_BLOCK: usize = RENDER_QUANTUM * 4;

/// Owns the `audio-render` thread for one session.
pub struct RenderThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Start rendering blocks from `reader` through `graph`. Interleaved
    /// stereo output goes to `output` when given; full queues drop blocks.
    pub fn spawn(
        reader: SampleReader,
        graph: Arc<Mutex<DspGraph>>,
        output: Option<mpsc::Sender<Vec<f32>>>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        log::info!(
            "Render thread starting - track: \"{}\", block: {} frames, output sink: {}",
            reader.track().label(),
            reader.preferred_block().unwrap_or(DEFAULT_BLOCK),
            output.is_some(),
        );

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-render".into())
                .spawn(move || render_loop(reader, &graph, output, &running))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("Render thread panicked");
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(
    mut reader: SampleReader,
    graph: &Mutex<DspGraph>,
    mut output: Option<mpsc::Sender<Vec<f32>>>,
    running: &AtomicBool,
) {
    let block = reader.preferred_block().unwrap_or(DEFAULT_BLOCK).max(1);
    let mut input = vec![0.0f32; block];
    let mut rendered = vec![0.0f32; block * 2];
    let mut dropped = 0u64;

    while running.load(Ordering::Relaxed) {
        let frames = match reader.read(&mut input) {
            Some(0) => continue,
            Some(n) => n,
            None => break,
        };

        graph.lock().render(&input[..frames], &mut rendered[..frames * 2]);

        let Some(tx) = &output else {
            continue;
        };
        match tx.try_send(rendered[..frames * 2].to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    log::warn!("Processed audio sink is full, {} blocks dropped", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::info!("Processed audio sink closed, rendering continues without it");
                output = None;
            }
        }
    }

    log::info!("Render thread stopped");
}
