//! Worker-thread pool that searches the nonce space for a template that
//! meets its target, coordinated by a pair of atomics and a one-shot
//! result channel rather than a per-worker result vector.

use crate::header::BlockTemplate;
use crate::pool::{best_effort_pin, VmPool};
use crate::target::hash_meets_target;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const LOG_TARGET: &str = "zrx_miner::engine";

/// A solution found by a worker: the full header, its RandomX hash, and
/// the template it was mined against (needed to assemble submission bytes).
#[derive(Clone)]
pub struct Solution {
    pub header: [u8; 140],
    pub hash: [u8; 32],
    pub template: BlockTemplate,
}

struct SharedState {
    mining: AtomicBool,
    found: AtomicBool,
    hash_count: AtomicU64,
}

/// Drives one mining session at a time over a borrowed [`VmPool`].
pub struct MiningEngine {
    state: Arc<SharedState>,
    start_time: Option<Instant>,
    solution_rx: Option<mpsc::Receiver<Solution>>,
    solution: Option<Solution>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Default for MiningEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MiningEngine {
    pub fn new() -> Self {
        MiningEngine {
            state: Arc::new(SharedState {
                mining: AtomicBool::new(false),
                found: AtomicBool::new(false),
                hash_count: AtomicU64::new(0),
            }),
            start_time: None,
            solution_rx: None,
            solution: None,
            handles: Vec::new(),
        }
    }

    pub fn is_mining(&self) -> bool {
        self.state.mining.load(Ordering::Acquire)
    }

    pub fn hash_count(&self) -> u64 {
        self.state.hash_count.load(Ordering::Relaxed)
    }

    pub fn hashrate(&self) -> f64 {
        match self.start_time {
            Some(t0) => {
                let elapsed = t0.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.hash_count() as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Spawn `pool.num_threads()` workers to search `template`'s nonce
    /// space. `pool` must already be keyed to `template.seed_hash`.
    pub fn start_mining(&mut self, pool: &mut VmPool, template: BlockTemplate) {
        assert!(!self.is_mining(), "mining session already running");
        assert_eq!(
            pool.seed_hash(),
            template.seed_hash,
            "pool is not keyed to this template's seed"
        );
        pool.begin_session()
            .expect("pool session already active; call stop() before starting a new one");

        self.state.mining.store(true, Ordering::Release);
        self.state.found.store(false, Ordering::Release);
        self.state.hash_count.store(0, Ordering::Relaxed);
        self.start_time = Some(Instant::now());
        self.solution = None;

        let (tx, rx) = mpsc::channel();
        self.solution_rx = Some(rx);

        let num_threads = pool.num_threads();
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let state = Arc::clone(&self.state);
            let tx = tx.clone();
            let template = template.clone();
            let cpu_id = pool.cpu_for_thread(worker_id);
            let vm_ptr: *mut crate::pool::VmHandle = pool.vm_for_thread(worker_id) as *mut _;
            // Safety: each worker is the sole owner of its VmHandle for the
            // lifetime of this session; the pool is not mutated while any
            // worker is running (enforced by `stop()` joining before the
            // caller can call `update_seed`/`resize`).
            struct SendVm(*mut crate::pool::VmHandle);
            unsafe impl Send for SendVm {}
            let vm_send = SendVm(vm_ptr);

            let handle = thread::spawn(move || {
                best_effort_pin(cpu_id);
                let vm = unsafe { &mut *vm_send.0 };
                worker_loop(worker_id as u32, vm, &template, &state, &tx);
            });
            handles.push(handle);
        }

        self.handles = handles;
    }

    /// Request cancellation, block until every worker has exited, and
    /// release the pool's session lock so `update_seed`/`resize` can run.
    pub fn stop(&mut self, pool: &VmPool) {
        self.state.mining.store(false, Ordering::Release);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        pool.end_session();
    }

    /// Returns the session's solution once a worker finds one, and keeps
    /// returning the same one on every later call (the channel itself is
    /// only ever drained once, on first recv).
    pub fn get_solution(&mut self) -> Option<Solution> {
        if self.solution.is_some() {
            return self.solution.clone();
        }
        if !self.state.found.load(Ordering::Acquire) {
            return None;
        }
        let found = self.solution_rx.as_ref().and_then(|rx| rx.try_recv().ok());
        if found.is_some() {
            self.solution = found.clone();
        }
        found
    }
}

fn worker_loop(
    worker_id: u32,
    vm: &mut crate::pool::VmHandle,
    template: &BlockTemplate,
    state: &SharedState,
    tx: &mpsc::Sender<Solution>,
) {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce[2..30]);
    // top and bottom two bytes left at zero: reserved protocol space and
    // per-worker extra-nonce bits respectively.

    while state.mining.load(Ordering::Acquire) && !state.found.load(Ordering::Acquire) {
        let header = template.build_header(&nonce);
        let hash = vm.hash(&header);
        state.hash_count.fetch_add(1, Ordering::Relaxed);

        if hash_meets_target(&hash, &template.target) {
            if state
                .found
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::info!(target: LOG_TARGET, "worker {} found a solution", worker_id);
                let _ = tx.send(Solution {
                    header,
                    hash,
                    template: template.clone(),
                });
                state.mining.store(false, Ordering::Release);
            }
            break;
        }

        increment_nonce(&mut nonce);
    }
}

fn increment_nonce(nonce: &mut [u8; 32]) {
    for byte in nonce.iter_mut() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return;
        }
    }
}
