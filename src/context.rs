//! Audio contexts: explicitly owned render engines handed out by a bounded pool.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::CommsError;

/// A processing stage attached to an [`AudioContext`].
pub trait RenderNode: Send {
    /// Process one quantum of `frames` frames.
    fn render(&mut self, frames: usize);

    /// Finished nodes are detached after the quantum in which they report it.
    fn finished(&self) -> bool {
        false
    }

    /// Release reader subscriptions and stop outputs. Called once on detach or close.
    fn disconnect(&mut self) {}
}

/// Lock-free `f32` parameter shared between control code and the render path.
#[derive(Clone, Debug)]
pub struct GainParam {
    bits: Arc<AtomicU32>,
}

impl GainParam {
    /// New parameter holding `value`.
    pub fn new(value: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(value.to_bits())),
        }
    }

    /// Takes effect from the next rendered sample.
    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Identifier of a node within its context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    id: u32,
}

struct PoolInner {
    sample_rate: u32,
    render_quantum: usize,
    max_contexts: usize,
    open: AtomicUsize,
    next_id: AtomicU32,
}

/// Bounded source of audio contexts. Hosts cap concurrent contexts per page, so every
/// context is counted from [`open`](Self::open) until [`AudioContext::close`].
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

impl ContextPool {
    /// A pool handing out contexts of `render_quantum` frames at `sample_rate`, at most
    /// `max_contexts` open at once.
    pub fn new(sample_rate: u32, render_quantum: usize, max_contexts: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sample_rate,
                render_quantum,
                max_contexts,
                open: AtomicUsize::new(0),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Open a new context, failing once the cap is reached.
    pub fn open(&self) -> Result<Arc<AudioContext>, CommsError> {
        let max = self.inner.max_contexts;
        self.inner
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < max).then_some(open + 1)
            })
            .map_err(|_| {
                warn!(max, "audio context limit reached");
                CommsError::ContextLimit(max)
            })?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, "audio context opened");
        Ok(Arc::new(AudioContext {
            id,
            sample_rate: self.inner.sample_rate,
            render_quantum: self.inner.render_quantum,
            nodes: Mutex::new(Vec::new()),
            next_node_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            frames_rendered: AtomicU64::new(0),
            pool: Arc::downgrade(&self.inner),
        }))
    }

    /// Contexts opened and not yet closed.
    pub fn open_count(&self) -> usize {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Sample rate of every context from this pool.
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Frames per render quantum.
    pub fn render_quantum(&self) -> usize {
        self.inner.render_quantum
    }
}

/// Render engine owning a set of [`RenderNode`]s, processed one quantum at a time in
/// attach order.
pub struct AudioContext {
    id: u32,
    sample_rate: u32,
    render_quantum: usize,
    nodes: Mutex<Vec<(NodeHandle, Box<dyn RenderNode>)>>,
    next_node_id: AtomicU32,
    closed: AtomicBool,
    frames_rendered: AtomicU64,
    pool: Weak<PoolInner>,
}

impl AudioContext {
    /// Pool-unique context id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered per quantum.
    pub fn render_quantum(&self) -> usize {
        self.render_quantum
    }

    /// Attach a node; it renders from the next quantum on.
    pub fn attach(&self, node: Box<dyn RenderNode>) -> Result<NodeHandle, CommsError> {
        if self.is_closed() {
            return Err(CommsError::ContextClosed(self.id));
        }
        let handle = NodeHandle {
            id: self.next_node_id.fetch_add(1, Ordering::Relaxed),
        };
        self.nodes.lock().push((handle, node));
        Ok(handle)
    }

    /// Detach and disconnect a node. Returns `false` if it was not attached.
    pub fn detach(&self, handle: NodeHandle) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(position) = nodes.iter().position(|(h, _)| *h == handle) else {
            return false;
        };
        let (_, mut node) = nodes.remove(position);
        node.disconnect();
        true
    }

    /// Attached render nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Render one quantum through every attached node. Returns frames rendered.
    pub fn render(&self) -> Result<usize, CommsError> {
        if self.is_closed() {
            return Err(CommsError::ContextClosed(self.id));
        }
        let frames = self.render_quantum;
        let mut nodes = self.nodes.lock();
        for (_, node) in nodes.iter_mut() {
            node.render(frames);
        }
        nodes.retain_mut(|(_, node)| {
            if node.finished() {
                node.disconnect();
                false
            } else {
                true
            }
        });
        self.frames_rendered
            .fetch_add(frames as u64, Ordering::Relaxed);
        Ok(frames)
    }

    /// Playback time derived from frames rendered so far.
    pub fn current_time(&self) -> Duration {
        let frames = self.frames_rendered.load(Ordering::Relaxed);
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }

    /// Disconnect every node and return the context to its pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut nodes = self.nodes.lock();
        for (_, node) in nodes.iter_mut() {
            node.disconnect();
        }
        nodes.clear();
        if let Some(pool) = self.pool.upgrade() {
            pool.open.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(context = self.id, "audio context closed");
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.close();
    }
}
