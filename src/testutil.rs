//! Test support: run a closure as every node of an in-process cluster

use std::sync::Arc;
use std::thread;

use crate::backend::cluster::ClusterArena;
use crate::backend::Backend;
use crate::runtime::config::EngineConfig;
use crate::runtime::Engine;
use crate::types::PAGE_SIZE;

/// A small engine configuration that keeps tests fast
pub fn small_config() -> EngineConfig {
    EngineConfig {
        memory_size: 64 * PAGE_SIZE,
        cache_size: 8 * PAGE_SIZE,
        write_buffer_size: 8,
        write_buffer_write_back_size: 2,
        ..EngineConfig::default()
    }
}

/// Spin up `nodes` engines over one arena and run `body` on each from its
/// own thread; engines are finalized collectively afterwards
pub fn run_cluster<F>(nodes: usize, cfg: EngineConfig, body: F)
where
    F: Fn(&Arc<Engine>) + Send + Sync + 'static,
{
    let arena = ClusterArena::new(nodes);
    let body = Arc::new(body);

    let handles: Vec<_> = (0..nodes)
        .map(|node| {
            let backend: Arc<dyn Backend> = Arc::new(arena.backend(node));
            let body = Arc::clone(&body);
            let cfg = cfg.clone();
            thread::Builder::new()
                .name(format!("node-{}", node))
                .spawn(move || {
                    let engine = Engine::new(cfg, backend, false).unwrap();
                    body(&engine);
                    engine.finalize().unwrap();
                })
                .expect("spawning a cluster node failed")
        })
        .collect();

    for handle in handles {
        handle.join().expect("a cluster node panicked");
    }
}
