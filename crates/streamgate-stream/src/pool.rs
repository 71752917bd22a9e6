//! Sharded dispatcher pool.
//!
//! Streams are partitioned across dispatcher threads by route affinity:
//! every frame for a given route lands on the same shard, so one
//! merged stream and all of its substreams always run on one thread and
//! the engines need no locks. Work arrives over an unbounded channel;
//! each shard thread drains it to completion.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use streamgate_core::frame::Frame;
use streamgate_core::GatewayConfig;

use crate::engine::Engine;

type Setup = Arc<dyn Fn(&mut Engine) + Send + Sync>;

enum EngineOp {
    Run(Box<dyn FnOnce(&mut Engine) + Send>),
    Inject(Frame),
    Shutdown,
}

struct Shard {
    tx: UnboundedSender<EngineOp>,
    handle: JoinHandle<()>,
}

pub struct DispatcherPool {
    shards: Vec<Shard>,
}

impl DispatcherPool {
    /// Spawns `shard_count` dispatcher threads. `setup` runs once per
    /// shard to bind routes before any frame is dispatched.
    pub fn new(shard_count: usize, config: GatewayConfig, setup: Setup) -> Self {
        assert!(shard_count > 0);
        let shards = (0..shard_count)
            .map(|shard_index| {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let config = config.clone();
                let setup = Arc::clone(&setup);
                let handle = std::thread::Builder::new()
                    .name(format!("streamgate-dispatch-{shard_index}"))
                    .spawn(move || {
                        let mut engine = Engine::new(config);
                        setup(&mut engine);
                        while let Some(op) = rx.blocking_recv() {
                            match op {
                                EngineOp::Run(f) => f(&mut engine),
                                EngineOp::Inject(frame) => engine.inject(frame),
                                EngineOp::Shutdown => break,
                            }
                        }
                        debug!(shard = shard_index, "dispatcher shard stopped");
                    })
                    .expect("spawn dispatcher thread");
                Shard { tx, handle }
            })
            .collect();
        Self { shards }
    }

    fn shard_for(&self, route_id: i64) -> &Shard {
        let index = (route_id as u64 % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Queues a frame onto the shard owning its route.
    pub fn inject(&self, frame: Frame) {
        let shard = self.shard_for(frame.route_id);
        let _ = shard.tx.send(EngineOp::Inject(frame));
    }

    /// Runs a closure on the shard owning `route_id` (e.g. to open a
    /// stream or bind a late route).
    pub fn run_on(&self, route_id: i64, f: impl FnOnce(&mut Engine) + Send + 'static) {
        let shard = self.shard_for(route_id);
        let _ = shard.tx.send(EngineOp::Run(Box::new(f)));
    }

    /// Stops every shard after its queue drains.
    pub fn shutdown(self) {
        for shard in &self.shards {
            let _ = shard.tx.send(EngineOp::Shutdown);
        }
        for shard in self.shards {
            let _ = shard.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_setup_runs_once_per_shard() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&calls);
        let pool = DispatcherPool::new(
            3,
            GatewayConfig::default(),
            Arc::new(move |_engine| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        pool.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_run_on_reaches_the_owning_shard() {
        let pool = DispatcherPool::new(2, GatewayConfig::default(), Arc::new(|_| {}));
        let (tx, rx) = std_mpsc::channel();
        pool.run_on(5, move |engine| {
            let id = engine.ctx.supply_initial_id();
            tx.send(id).unwrap();
        });
        let id = rx.recv().unwrap();
        assert_eq!(id & 1, 1);
        pool.shutdown();
    }

    #[test]
    fn test_same_route_same_shard() {
        let pool = DispatcherPool::new(4, GatewayConfig::default(), Arc::new(|_| {}));
        let (tx, rx) = std_mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            pool.run_on(9, move |_engine| {
                tx.send(std::thread::current().name().map(str::to_string))
                    .unwrap();
            });
        }
        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first, second);
        pool.shutdown();
    }
}
