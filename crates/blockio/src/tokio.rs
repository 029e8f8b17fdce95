use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

/// The process can share a single Tokio runtime.
///
/// It only hosts the bootstrap control plane: the controller's RPC service
/// and the clients that call it.  Block traffic never runs on it.
pub static TOKIO: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_multi_thread()
        .thread_name_fn(|| {
            use std::sync::atomic::{AtomicUsize, Ordering};
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("blockio-tokio-{}", id)
        })
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
});
