//! Frame prefetching on a loader thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::bounded;
use log::debug;

use crate::core::RgbdFrame;
use crate::io::{Dataset, DatasetError};

/// Loads frames ahead of the consumer through a bounded channel.
///
/// The loader only decodes frames; everything the consumer does happens on
/// the calling thread. A capacity of 0 loads frames inline.
pub struct FramePrefetcher<'a, D: Dataset + Sync> {
    dataset: &'a D,
    capacity: usize,
    stop: &'a AtomicBool,
}

impl<'a, D: Dataset + Sync> FramePrefetcher<'a, D> {
    pub fn new(dataset: &'a D, capacity: usize, stop: &'a AtomicBool) -> Self {
        Self { dataset, capacity, stop }
    }

    /// Feed every index in order to `consume` along with its load result.
    ///
    /// Stops early, without error, once the stop flag is raised; returns
    /// whether all indices were consumed. An error from `consume` ends the
    /// run and is returned.
    pub fn for_each<F, E>(&self, indices: &[usize], mut consume: F) -> Result<bool, E>
    where
        F: FnMut(usize, Result<RgbdFrame, DatasetError>) -> Result<(), E>,
    {
        if self.capacity == 0 {
            for &index in indices {
                if self.stop.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                consume(index, self.dataset.load_frame(index))?;
            }
            return Ok(true);
        }

        let dataset = self.dataset;
        let stop = self.stop;
        thread::scope(|scope| {
            let (tx, rx) = bounded(self.capacity);
            scope.spawn(move || {
                for &index in indices {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if tx.send((index, dataset.load_frame(index))).is_err() {
                        debug!("prefetch consumer gone, loader stopping at frame {}", index);
                        break;
                    }
                }
            });

            let mut consumed = 0;
            for (index, result) in rx.iter() {
                if stop.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                consume(index, result)?;
                consumed += 1;
            }
            Ok(consumed == indices.len())
        })
    }
}
