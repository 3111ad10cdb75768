use crate::config::ConfigErrors;
use std::{collections::BTreeMap, fmt};


/// Where a newly launched run may go. `gpu` is `None` when no accelerators
/// are configured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub gpu: Option<String>,
}

/// Concurrency budget of one scheduler session.
///
/// Counters only, no I/O and no validation on `allocate`/`free`: callers
/// allocate a slot returned by `is_free` and free it exactly once.
#[derive(Clone, Debug)]
pub struct ResourcePool {
    procs_no: usize,
    gpus: Vec<String>,
    per_gpu: BTreeMap<String, usize>,
    running_on: BTreeMap<String, usize>,
    running: usize,
}

impl ResourcePool {
    /// `per_gpu` holds either one cap shared by every gpu or one cap per gpu
    pub fn new(procs_no: usize, gpus: &[String], per_gpu: &[usize]) -> Result<Self, ConfigErrors> {
        let per_gpu: BTreeMap<String, usize> = match (gpus.len(), per_gpu) {
            (0, _) => BTreeMap::new(),
            (_, [cap]) => gpus.iter().map(|gpu| (gpu.clone(), *cap)).collect(),
            (len, caps) if len == caps.len() => gpus.iter().cloned().zip(caps.iter().copied()).collect(),
            (len, caps) => {
                return Err(ConfigErrors::MismatchedPerGpu {
                    gpus: len,
                    caps: caps.len(),
                })
            }
        };

        Ok(Self {
            procs_no,
            gpus: gpus.to_vec(),
            running_on: gpus.iter().map(|gpu| (gpu.clone(), 0)).collect(),
            per_gpu,
            running: 0,
        })
    }

    /// First slot with room left, `None` when the session is saturated
    pub fn is_free(&self) -> Option<Slot> {
        if self.running >= self.procs_no {
            return None;
        }

        if self.gpus.is_empty() {
            return Some(Slot { gpu: None });
        }

        self.gpus
            .iter()
            .find(|gpu| self.running_on(gpu) < self.per_gpu.get(gpu.as_str()).copied().unwrap_or(0))
            .map(|gpu| Slot {
                gpu: Some(gpu.clone()),
            })
    }

    pub fn allocate(&mut self, slot: &Slot) {
        if let Some(running) = slot.gpu.as_ref().and_then(|gpu| self.running_on.get_mut(gpu)) {
            *running += 1;
        }
        self.running += 1;
    }

    pub fn free(&mut self, slot: &Slot) {
        if let Some(running) = slot.gpu.as_ref().and_then(|gpu| self.running_on.get_mut(gpu)) {
            *running = running.saturating_sub(1);
        }
        self.running = self.running.saturating_sub(1);
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn running_on(&self, gpu: &str) -> usize {
        self.running_on.get(gpu).copied().unwrap_or(0)
    }
}

impl fmt::Display for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Procs: {} / {}", self.running, self.procs_no)?;

        if !self.gpus.is_empty() {
            write!(f, " | {} GPUS:", self.gpus.len())?;
            for gpu in self.gpus.iter() {
                write!(
                    f,
                    " {gpu}:{}/{};",
                    self.running_on(gpu),
                    self.per_gpu.get(gpu).copied().unwrap_or(0)
                )?;
            }
        }

        Ok(())
    }
}
