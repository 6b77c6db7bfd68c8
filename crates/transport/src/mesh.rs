//! In-process multi-rank transport.
//!
//! Every rank gets a [`MeshEndpoint`] with a dedicated inbound channel and
//! receiver thread; collectives rendezvous on one shared generation-stamped
//! state. Semantics match the MPI subset the framebuffer uses: blocking
//! collectives issued in identical order on every rank, and point-to-point
//! sends that stay live while a collective is in flight.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};

use crate::{Message, MessageHandler, Rank, RankGroup, Transport, TransportError};

/// Builds a fully connected mesh of `count` ranks and starts one receiver
/// thread per rank. Threads exit when every endpoint has been dropped.
pub fn create_mesh(count: usize) -> Vec<Arc<MeshEndpoint>> {
    assert!(count > 0, "mesh must have at least one rank");
    debug!("creating in-process mesh with {count} ranks");

    let mut senders = Vec::with_capacity(count);
    let mut receivers = Vec::with_capacity(count);
    for _ in 0..count {
        let (sender, receiver) = unbounded::<Message>();
        senders.push(sender);
        receivers.push(receiver);
    }

    let collective = Arc::new(CollectiveState::new(count));

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receiver)| {
            let inbox = Arc::new(Mutex::new(Inbox::default()));
            spawn_receiver(rank, receiver, inbox.clone());
            Arc::new(MeshEndpoint {
                group: RankGroup::new(Rank(rank), count),
                senders: senders.clone(),
                inbox,
                collective: collective.clone(),
            })
        })
        .collect()
}

#[derive(Default)]
struct Inbox {
    handler: Option<Arc<dyn MessageHandler>>,
    /// Messages that arrived before a handler was registered; replayed in
    /// arrival order the moment one is.
    pending: Vec<Message>,
}

fn spawn_receiver(rank: usize, receiver: Receiver<Message>, inbox: Arc<Mutex<Inbox>>) {
    thread::Builder::new()
        .name(format!("mesh-recv-{rank}"))
        .spawn(move || {
            while let Ok(message) = receiver.recv() {
                let handler = {
                    let mut inbox = inbox.lock().expect("mesh inbox poisoned");
                    match &inbox.handler {
                        Some(handler) => handler.clone(),
                        None => {
                            inbox.pending.push(message);
                            continue;
                        }
                    }
                };
                handler.incoming(message);
            }
            trace!("mesh receiver {rank} shutting down");
        })
        .expect("failed to spawn mesh receiver thread");
}

pub struct MeshEndpoint {
    group: RankGroup,
    senders: Vec<Sender<Message>>,
    inbox: Arc<Mutex<Inbox>>,
    collective: Arc<CollectiveState>,
}

impl Transport for MeshEndpoint {
    fn group(&self) -> RankGroup {
        self.group
    }

    fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut inbox = self.inbox.lock().expect("mesh inbox poisoned");
        inbox.handler = Some(handler.clone());
        // Drain under the lock so replayed messages stay ahead of anything
        // the receiver thread delivers next.
        for message in inbox.pending.drain(..) {
            handler.incoming(message);
        }
    }

    fn send_to(&self, rank: Rank, message: Message) -> Result<(), TransportError> {
        let sender = self
            .senders
            .get(rank.0)
            .ok_or(TransportError::RankOutOfRange {
                rank: rank.0,
                count: self.senders.len(),
            })?;
        trace!(
            "mesh send {} -> {}: {} bytes",
            self.group.this_rank(),
            rank,
            message.len()
        );
        sender
            .send(message)
            .map_err(|_| TransportError::Disconnected { channel: "mesh inbound" })
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.collective
            .exchange(self.group.this_rank().0, OpKind::Barrier, Deposit::Empty);
        Ok(())
    }

    fn bcast_i32(&self, root: Rank, buf: &mut [i32]) -> Result<(), TransportError> {
        let deposit = if self.group.this_rank() == root {
            Deposit::I32s(buf.to_vec())
        } else {
            Deposit::Len(buf.len())
        };
        let result = self.collective.exchange(
            self.group.this_rank().0,
            OpKind::Bcast { root: root.0 },
            deposit,
        );
        match result {
            Deposit::I32s(values) => {
                buf.copy_from_slice(&values);
                Ok(())
            }
            other => panic!("bcast_i32 produced unexpected payload {other:?}"),
        }
    }

    fn bcast_f32(&self, root: Rank, buf: &mut [f32]) -> Result<(), TransportError> {
        let deposit = if self.group.this_rank() == root {
            Deposit::F32s(buf.to_vec())
        } else {
            Deposit::Len(buf.len())
        };
        let result = self.collective.exchange(
            self.group.this_rank().0,
            OpKind::Bcast { root: root.0 },
            deposit,
        );
        match result {
            Deposit::F32s(values) => {
                buf.copy_from_slice(&values);
                Ok(())
            }
            other => panic!("bcast_f32 produced unexpected payload {other:?}"),
        }
    }

    fn gather_i32(&self, root: Rank, send: i32) -> Result<Option<Vec<i32>>, TransportError> {
        let result = self.collective.exchange(
            self.group.this_rank().0,
            OpKind::Gather { root: root.0 },
            Deposit::I32(send),
        );
        match result {
            Deposit::Empty => Ok(None),
            Deposit::I32s(values) => Ok(Some(values)),
            other => panic!("gather_i32 produced unexpected payload {other:?}"),
        }
    }

    fn gatherv_bytes(&self, root: Rank, send: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let result = self.collective.exchange(
            self.group.this_rank().0,
            OpKind::Gather { root: root.0 },
            Deposit::Bytes(send.to_vec()),
        );
        match result {
            Deposit::Empty => Ok(None),
            Deposit::Bytes(bytes) => Ok(Some(bytes)),
            other => panic!("gatherv_bytes produced unexpected payload {other:?}"),
        }
    }

    fn reduce_f64_min(&self, root: Rank, value: f64) -> Result<Option<f64>, TransportError> {
        self.reduce(root, value, OpKind::ReduceMin { root: root.0 })
    }

    fn reduce_f64_max(&self, root: Rank, value: f64) -> Result<Option<f64>, TransportError> {
        self.reduce(root, value, OpKind::ReduceMax { root: root.0 })
    }
}

impl MeshEndpoint {
    fn reduce(&self, root: Rank, value: f64, op: OpKind) -> Result<Option<f64>, TransportError> {
        let result = self
            .collective
            .exchange(self.group.this_rank().0, op, Deposit::F64(value));
        match result {
            Deposit::Empty => Ok(None),
            Deposit::F64(reduced) => {
                if self.group.this_rank() == root {
                    Ok(Some(reduced))
                } else {
                    Ok(None)
                }
            }
            other => panic!("reduce produced unexpected payload {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Barrier,
    Bcast { root: usize },
    Gather { root: usize },
    ReduceMin { root: usize },
    ReduceMax { root: usize },
}

#[derive(Debug, Clone)]
enum Deposit {
    Empty,
    /// Non-root bcast participants announce only their buffer length.
    Len(usize),
    I32(i32),
    F64(f64),
    I32s(Vec<i32>),
    F32s(Vec<f32>),
    Bytes(Vec<u8>),
}

struct CollectiveState {
    count: usize,
    inner: Mutex<CollectiveInner>,
    arrived_cv: Condvar,
}

struct CollectiveInner {
    generation: u64,
    arrived: usize,
    departed: usize,
    op: Option<OpKind>,
    deposits: Vec<Deposit>,
    results: Vec<Deposit>,
}

impl CollectiveState {
    fn new(count: usize) -> Self {
        Self {
            count,
            inner: Mutex::new(CollectiveInner {
                generation: 0,
                arrived: 0,
                departed: 0,
                op: None,
                deposits: vec![Deposit::Empty; count],
                results: vec![Deposit::Empty; count],
            }),
            arrived_cv: Condvar::new(),
        }
    }

    /// One rendezvous: every rank deposits, the last arrival combines, and
    /// each rank leaves with its own result. Ranks re-entering for the next
    /// collective wait until the previous one has fully drained.
    fn exchange(&self, rank: usize, op: OpKind, deposit: Deposit) -> Deposit {
        let mut inner = self.inner.lock().expect("collective state poisoned");

        while inner.departed != 0 {
            inner = self
                .arrived_cv
                .wait(inner)
                .expect("collective state poisoned");
        }

        match inner.op {
            None => inner.op = Some(op),
            Some(active) => assert_eq!(
                active, op,
                "collective mismatch: rank {rank} entered {op:?} while {active:?} is in flight"
            ),
        }

        let my_generation = inner.generation;
        inner.deposits[rank] = deposit;
        inner.arrived += 1;

        if inner.arrived == self.count {
            let op = inner.op.take().expect("collective op must be set");
            combine(op, self.count, &mut inner);
            inner.arrived = 0;
            inner.departed = self.count;
            inner.generation += 1;
            self.arrived_cv.notify_all();
        } else {
            while inner.generation == my_generation {
                inner = self
                    .arrived_cv
                    .wait(inner)
                    .expect("collective state poisoned");
            }
        }

        let result = std::mem::replace(&mut inner.results[rank], Deposit::Empty);
        inner.departed -= 1;
        if inner.departed == 0 {
            self.arrived_cv.notify_all();
        }
        result
    }
}

fn combine(op: OpKind, count: usize, inner: &mut CollectiveInner) {
    match op {
        OpKind::Barrier => {
            for slot in inner.results.iter_mut() {
                *slot = Deposit::Empty;
            }
        }
        OpKind::Bcast { root } => {
            let payload = std::mem::replace(&mut inner.deposits[root], Deposit::Empty);
            let payload_len = match &payload {
                Deposit::I32s(values) => values.len(),
                Deposit::F32s(values) => values.len(),
                other => panic!("bcast root deposited unexpected payload {other:?}"),
            };
            for (rank, deposit) in inner.deposits.iter().enumerate() {
                if rank == root {
                    continue;
                }
                let Deposit::Len(len) = deposit else {
                    panic!("bcast participant {rank} deposited unexpected payload {deposit:?}")
                };
                assert_eq!(
                    *len, payload_len,
                    "bcast buffer length differs between rank {rank} and root {root}"
                );
            }
            for slot in inner.results.iter_mut() {
                *slot = payload.clone();
            }
        }
        OpKind::Gather { root } => {
            let mut gathered_i32 = Vec::new();
            let mut gathered_bytes = Vec::new();
            let mut saw_bytes = false;
            for deposit in inner.deposits.iter_mut() {
                match std::mem::replace(deposit, Deposit::Empty) {
                    Deposit::I32(value) => gathered_i32.push(value),
                    Deposit::Bytes(bytes) => {
                        saw_bytes = true;
                        gathered_bytes.extend_from_slice(&bytes);
                    }
                    other => panic!("gather participant deposited unexpected payload {other:?}"),
                }
            }
            if saw_bytes {
                assert!(
                    gathered_i32.is_empty(),
                    "gather mixed i32 and byte deposits"
                );
                inner.results[root] = Deposit::Bytes(gathered_bytes);
            } else {
                assert_eq!(gathered_i32.len(), count, "gather missed a deposit");
                inner.results[root] = Deposit::I32s(gathered_i32);
            }
            for (rank, slot) in inner.results.iter_mut().enumerate() {
                if rank != root {
                    *slot = Deposit::Empty;
                }
            }
        }
        OpKind::ReduceMin { root } | OpKind::ReduceMax { root } => {
            let take_max = matches!(op, OpKind::ReduceMax { .. });
            let mut reduced: Option<f64> = None;
            for deposit in inner.deposits.iter_mut() {
                let Deposit::F64(value) = std::mem::replace(deposit, Deposit::Empty) else {
                    panic!("reduce participant deposited a non-f64 payload")
                };
                reduced = Some(match reduced {
                    None => value,
                    Some(current) if take_max => current.max(value),
                    Some(current) => current.min(value),
                });
            }
            for (rank, slot) in inner.results.iter_mut().enumerate() {
                *slot = if rank == root {
                    Deposit::F64(reduced.expect("reduce over empty group"))
                } else {
                    Deposit::Empty
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn on_all_ranks<F>(count: usize, body: F)
    where
        F: Fn(Arc<MeshEndpoint>) + Send + Sync + 'static,
    {
        let endpoints = create_mesh(count);
        let body = Arc::new(body);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let body = body.clone();
                thread::spawn(move || body(endpoint))
            })
            .collect();
        for handle in handles {
            handle.join().expect("rank thread should not panic");
        }
    }

    #[test]
    fn bcast_overwrites_non_root_buffers() {
        on_all_ranks(3, |endpoint| {
            let root = Rank(0);
            let mut buf = if endpoint.group().is_master() {
                vec![7, 8, 9]
            } else {
                vec![0, 0, 0]
            };
            endpoint
                .bcast_i32(root, &mut buf)
                .expect("bcast should succeed");
            assert_eq!(buf, vec![7, 8, 9]);
        });
    }

    #[test]
    fn gather_orders_results_by_rank() {
        on_all_ranks(4, |endpoint| {
            let me = endpoint.group().this_rank();
            let gathered = endpoint
                .gather_i32(Rank(0), me.0 as i32 * 10)
                .expect("gather should succeed");
            if me == Rank(0) {
                assert_eq!(gathered, Some(vec![0, 10, 20, 30]));
            } else {
                assert_eq!(gathered, None);
            }
        });
    }

    #[test]
    fn gatherv_concatenates_blocks_in_rank_order() {
        on_all_ranks(3, |endpoint| {
            let me = endpoint.group().this_rank().0 as u8;
            let block = vec![me; me as usize + 1];
            let gathered = endpoint
                .gatherv_bytes(Rank(0), &block)
                .expect("gatherv should succeed");
            if me == 0 {
                assert_eq!(gathered, Some(vec![0, 1, 1, 2, 2, 2]));
            } else {
                assert_eq!(gathered, None);
            }
        });
    }

    #[test]
    fn reduce_min_and_max_land_on_root_only() {
        on_all_ranks(3, |endpoint| {
            let value = endpoint.group().this_rank().0 as f64 + 1.0;
            let min = endpoint
                .reduce_f64_min(Rank(0), value)
                .expect("reduce should succeed");
            let max = endpoint
                .reduce_f64_max(Rank(0), value)
                .expect("reduce should succeed");
            if endpoint.group().is_master() {
                assert_eq!(min, Some(1.0));
                assert_eq!(max, Some(3.0));
            } else {
                assert_eq!(min, None);
                assert_eq!(max, None);
            }
        });
    }

    #[test]
    fn collectives_can_run_back_to_back() {
        on_all_ranks(3, |endpoint| {
            for round in 0..16 {
                endpoint.barrier().expect("barrier should succeed");
                let mut buf = vec![if endpoint.group().is_master() { round } else { -1 }];
                endpoint
                    .bcast_i32(Rank(0), &mut buf)
                    .expect("bcast should succeed");
                assert_eq!(buf[0], round);
            }
        });
    }

    struct CountingHandler {
        seen: AtomicUsize,
    }

    impl MessageHandler for CountingHandler {
        fn incoming(&self, _message: Message) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn messages_before_handler_registration_are_replayed() {
        let endpoints = create_mesh(2);
        endpoints[0]
            .send_to(Rank(1), Message::new(vec![1]))
            .expect("send should succeed");
        endpoints[0]
            .send_to(Rank(1), Message::new(vec![2]))
            .expect("send should succeed");

        // Let the receiver thread park both messages as pending.
        thread::sleep(std::time::Duration::from_millis(50));

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        });
        endpoints[1].set_handler(handler.clone());
        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
    }
}
