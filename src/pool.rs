//! A thread-safe pool of reusable objects (primarily large byte buffers),
//! returned to the pool automatically when a [`Scoped`] handle is dropped.
//!
//! No corpus repo carries a direct analog of this component; it follows
//! the general RAII-guard idiom used throughout the pack wherever a
//! resource must be released exactly once (e.g. the lock guards threaded
//! through `Pane`), specialized into a pool rather than a single slot.

use std::sync::{Arc, Mutex};

use crate::error::PoolError;

type FactoryFn<T> = dyn Fn() -> T + Send + Sync;
type ResetFn<T> = dyn Fn(&mut T) + Send + Sync;
type DisposeFn<T> = dyn Fn(T) + Send + Sync;

struct Inner<T> {
    free: Mutex<Vec<T>>,
    factory: Box<FactoryFn<T>>,
    reset: Box<ResetFn<T>>,
    dispose: Option<Box<DisposeFn<T>>>,
}

/// A pool of reusable `T`s. Cloning shares the same underlying pool.
#[derive(Clone)]
pub struct ObjectPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// `factory` creates a new object when the pool is empty. `reset` runs
    /// on an object just before it's handed back out... no: `reset` runs
    /// when a scope releases an object, preparing it for its next borrow.
    /// `dispose` runs on every object dropped by [`ObjectPool::clear`]; a
    /// `None` dispose means "drop normally".
    pub fn new<F, R>(factory: F, reset: R) -> Result<Self, PoolError>
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::with_dispose(factory, reset, None::<fn(T)>)
    }

    pub fn with_dispose<F, R, D>(factory: F, reset: R, dispose: Option<D>) -> Result<Self, PoolError>
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Ok(ObjectPool {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
                factory: Box::new(factory),
                reset: Box::new(reset),
                dispose: dispose.map(|d| Box::new(d) as Box<DisposeFn<T>>),
            }),
        })
    }

    /// Hands out a scoped object: an existing pooled one if available,
    /// else a freshly-made one. No borrow blocks on another borrow's
    /// release — an empty pool just grows.
    pub fn borrow(&self) -> Scoped<T> {
        let obj = self.inner.free.lock().unwrap().pop().unwrap_or_else(|| (self.inner.factory)());
        Scoped {
            inner: Arc::clone(&self.inner),
            obj: Some(obj),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes of every pooled object and empties the pool. Objects
    /// currently borrowed are unaffected; they return to an empty pool
    /// on release.
    pub fn clear(&self) {
        let mut free = self.inner.free.lock().unwrap();
        let drained: Vec<T> = free.drain(..).collect();
        drop(free);
        if let Some(dispose) = &self.inner.dispose {
            for obj in drained {
                dispose(obj);
            }
        }
    }
}

/// A borrowed object. On drop (or explicit [`Scoped::release`]), `reset`
/// runs and the object returns to the pool. A second release is a no-op;
/// accessing the object after release returns `UseAfterRelease`.
pub struct Scoped<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    obj: Option<T>,
}

impl<T: Send + 'static> Scoped<T> {
    pub fn get(&self) -> Result<&T, PoolError> {
        self.obj.as_ref().ok_or(PoolError::UseAfterRelease)
    }

    pub fn get_mut(&mut self) -> Result<&mut T, PoolError> {
        self.obj.as_mut().ok_or(PoolError::UseAfterRelease)
    }

    /// Idempotent: releasing an already-released handle is a no-op.
    pub fn release(&mut self) {
        if let Some(mut obj) = self.obj.take() {
            (self.inner.reset)(&mut obj);
            self.inner.free.lock().unwrap().push(obj);
        }
    }
}

impl<T: Send + 'static> Drop for Scoped<T> {
    fn drop(&mut self) {
        self.release();
    }
}
