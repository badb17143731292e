//! Prefetcher (C7): a fixed ring of `depth` layer buffers serviced by a
//! single background worker thread. The compute thread requests layer
//! ids ahead of the compute frontier, waits for them to become ready in
//! ascending order, and releases them back to the pool after use.
//!
//! The pool state (buffers, wake signal, stats) lives in `PoolInner`
//! behind an `Arc` shared between the owning `Prefetcher` and its worker
//! thread -- the idiomatic alternative to the reference implementation's
//! single process-wide mutex, since it lets the worker block on I/O for
//! one buffer without holding a lock any other buffer's readers need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::container::GgufContainer;
use crate::layer_buffer::{BufferState, LayerBuffer};
use crate::model_loader::ModelLoader;
use crate::tensor_map::TensorMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrefetchStats {
    pub layer_loads: u64,
    pub layer_bytes_read: u64,
    pub max_layer_size: u64,
    pub peak_buffer_usage: u64,
    pub max_concurrent_buffers: u32,
    pub prefetch_hits: u64,
    pub prefetch_misses: u64,
}

/// Opaque ticket naming a buffer slot. Not `Clone`/`Copy`: it is consumed
/// by exactly one `wait` call, per the "short-lived ticket" design note.
pub struct RequestHandle {
    slot: usize,
}

struct WorkerSignal {
    loading: bool,
}

struct PoolInner {
    buffers: Vec<Mutex<LayerBuffer>>,
    signal: Mutex<WorkerSignal>,
    ready_cv: Condvar,
    cancelled: AtomicBool,
    stats: Mutex<PrefetchStats>,
}

impl PoolInner {
    fn worker_loop(&self, loader: &mut ModelLoader) {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            let mut did_work = false;
            for slot in 0..self.buffers.len() {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let layer_id = {
                    let buf = self.buffers[slot].lock().unwrap();
                    if buf.state == BufferState::Loading { buf.layer_id } else { None }
                };
                let Some(layer_id) = layer_id else { continue };

                let mut buf = self.buffers[slot].lock().unwrap();
                let result = loader.load_layer(layer_id, &mut buf);
                match result {
                    Ok(()) => buf.state = BufferState::Ready,
                    Err(_) => buf.state = BufferState::Error,
                }
                drop(buf);
                did_work = true;

                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.layer_loads = loader.layer_loads;
                    stats.layer_bytes_read = loader.layer_bytes_read;
                }
                self.update_concurrency();
                self.ready_cv.notify_all();
            }

            if !did_work && !self.cancelled.load(Ordering::Acquire) {
                let guard = self.signal.lock().unwrap();
                let (mut guard, _timeout) = self
                    .ready_cv
                    .wait_timeout_while(guard, std::time::Duration::from_millis(20), |s| !s.loading)
                    .unwrap();
                guard.loading = false;
            }
        }
    }

    fn update_concurrency(&self) {
        let active = self
            .buffers
            .iter()
            .filter(|b| {
                let b = b.lock().unwrap();
                matches!(b.state, BufferState::Loading | BufferState::InUse)
            })
            .count() as u32;
        let mut stats = self.stats.lock().unwrap();
        stats.max_concurrent_buffers = stats.max_concurrent_buffers.max(active);
    }

    fn request(&self, layer_id: u32) -> Option<RequestHandle> {
        for slot in 0..self.buffers.len() {
            let mut buf = self.buffers[slot].lock().unwrap();
            if buf.state == BufferState::Empty {
                buf.state = BufferState::Loading;
                buf.layer_id = Some(layer_id);
                drop(buf);
                {
                    let mut signal = self.signal.lock().unwrap();
                    signal.loading = true;
                }
                self.ready_cv.notify_all();
                self.update_concurrency();
                return Some(RequestHandle { slot });
            }
        }
        None
    }

    fn wait(&self, handle: RequestHandle) -> Option<MutexGuard<'_, LayerBuffer>> {
        let mut guard = self.buffers[handle.slot].lock().unwrap();
        let mut observed_loading = false;
        while guard.state == BufferState::Loading {
            if self.cancelled.load(Ordering::Acquire) {
                return None;
            }
            observed_loading = true;
            guard = self.ready_cv.wait_timeout(guard, std::time::Duration::from_millis(20)).unwrap().0;
        }

        {
            let mut stats = self.stats.lock().unwrap();
            if observed_loading {
                stats.prefetch_misses += 1;
            } else {
                stats.prefetch_hits += 1;
            }
        }

        match guard.state {
            BufferState::Ready => {
                guard.state = BufferState::InUse;
                drop(guard);
                self.update_concurrency();
                Some(self.buffers[handle.slot].lock().unwrap())
            }
            _ => None,
        }
    }

    fn release(&self, mut guard: MutexGuard<'_, LayerBuffer>) {
        guard.state = BufferState::Empty;
        guard.layer_id = None;
        guard.view = None;
        guard.used = 0;
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.ready_cv.notify_all();
        let mut signal = self.signal.lock().unwrap();
        signal.loading = true;
    }

    fn stats(&self) -> PrefetchStats {
        self.stats.lock().unwrap().clone()
    }
}

pub struct Prefetcher {
    pool: Arc<PoolInner>,
    worker: Option<JoinHandle<ModelLoader>>,
}

impl Prefetcher {
    /// Spawns the background worker and allocates `depth` buffers of
    /// `buffer_capacity` bytes each. The spec's supported depths are 2
    /// and 3; any positive depth works here.
    pub fn new(container: Arc<GgufContainer>, tensor_map: Arc<TensorMap>, depth: u32, buffer_capacity: u64) -> Self {
        let buffers: Vec<Mutex<LayerBuffer>> =
            (0..depth.max(1)).map(|_| Mutex::new(LayerBuffer::new(buffer_capacity as usize))).collect();

        let pool = Arc::new(PoolInner {
            buffers,
            signal: Mutex::new(WorkerSignal { loading: false }),
            ready_cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
            stats: Mutex::new(PrefetchStats { max_layer_size: buffer_capacity, ..Default::default() }),
        });

        let mut loader = ModelLoader::new(container, tensor_map);
        let worker_pool = pool.clone();
        let worker = std::thread::spawn(move || {
            worker_pool.worker_loop(&mut loader);
            loader
        });

        Prefetcher { pool, worker: Some(worker) }
    }

    /// Acquires an `EMPTY` buffer, transitions it to `LOADING`, and wakes
    /// the worker. Returns `None` if every buffer is currently in use.
    pub fn request(&self, layer_id: u32) -> Option<RequestHandle> {
        self.pool.request(layer_id)
    }

    /// Blocks until the requested buffer is `READY` or `ERROR`/cancelled.
    /// On success, transitions it to `IN_USE` and returns a guard the
    /// caller reads the `LayerView`/`data` through; release it back to
    /// the pool via `release` when done.
    pub fn wait(&self, handle: RequestHandle) -> Option<MutexGuard<'_, LayerBuffer>> {
        self.pool.wait(handle)
    }

    /// Returns a buffer to `EMPTY`, clearing its layer id and view.
    pub fn release(&self, guard: MutexGuard<'_, LayerBuffer>) {
        self.pool.release(guard)
    }

    pub fn cancel(&self) {
        self.pool.cancel();
    }

    pub fn stats(&self) -> PrefetchStats {
        self.pool.stats()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.pool.cancel();
        if let Some(join) = self.worker.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::GgmlType;
    use std::io::Write;

    fn write_test_gguf(n_layers: u32) -> std::path::PathBuf {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("prefetcher_test_{}.gguf", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"GGUF").unwrap();
        f.write_all(&3u32.to_le_bytes()).unwrap();

        // tensors: 9 per layer
        let n_tensors = 9 * n_layers as i64;
        f.write_all(&n_tensors.to_le_bytes()).unwrap();
        f.write_all(&1i64.to_le_bytes()).unwrap(); // 1 kv: llama.block_count

        let key = "llama.block_count";
        f.write_all(&(key.len() as u64).to_le_bytes()).unwrap();
        f.write_all(key.as_bytes()).unwrap();
        f.write_all(&4u32.to_le_bytes()).unwrap(); // type u32
        f.write_all(&n_layers.to_le_bytes()).unwrap();

        let fields = [
            "attn_norm.weight",
            "attn_q.weight",
            "attn_k.weight",
            "attn_v.weight",
            "attn_output.weight",
            "ffn_norm.weight",
            "ffn_gate.weight",
            "ffn_up.weight",
            "ffn_down.weight",
        ];
        let mut offset = 0u64;
        let row = 32u64; // one Q8_0 block's worth per tensor, for simplicity
        for layer in 0..n_layers {
            for field in fields {
                let name = format!("blk.{layer}.{field}");
                f.write_all(&(name.len() as u64).to_le_bytes()).unwrap();
                f.write_all(name.as_bytes()).unwrap();
                f.write_all(&1u32.to_le_bytes()).unwrap(); // n_dims
                f.write_all(&row.to_le_bytes()).unwrap(); // dims[0]
                f.write_all(&0u32.to_le_bytes()).unwrap(); // dtype F32
                f.write_all(&offset.to_le_bytes()).unwrap();
                offset += row * 4;
            }
        }

        let pos = {
            use std::io::Seek;
            f.stream_position().unwrap()
        };
        let aligned = (pos + 31) / 32 * 32;
        f.write_all(&vec![0u8; (aligned - pos) as usize]).unwrap();
        f.write_all(&vec![0u8; offset as usize]).unwrap();
        path
    }

    #[test]
    fn request_wait_release_cycles_through_all_layers() {
        let n_layers = 4u32;
        let path = write_test_gguf(n_layers);
        let container = Arc::new(GgufContainer::open(&path, false).unwrap());
        let tensor_map = Arc::new(TensorMap::build(&container).unwrap());
        let capacity = tensor_map.max_layer_size() + 9 * 32;

        let prefetcher = Prefetcher::new(container, tensor_map, 2, capacity);
        let mut handles = vec![prefetcher.request(0).unwrap(), prefetcher.request(1).unwrap()];

        for layer in 0..n_layers {
            let handle = handles.remove(0);
            let buf = prefetcher.wait(handle).expect("layer should load successfully");
            assert_eq!(buf.view.as_ref().unwrap().layer_id, layer);
            assert_eq!(buf.view.as_ref().unwrap().dtype(0), GgmlType::F32);
            prefetcher.release(buf);
            if layer + 2 < n_layers {
                handles.push(prefetcher.request(layer + 2).unwrap());
            }
        }

        let stats = prefetcher.stats();
        assert_eq!(stats.layer_loads, n_layers as u64);
        assert!(stats.max_concurrent_buffers <= 2);
        std::fs::remove_file(&path).ok();
    }
}
