//! Gradient synchronization across workers using local threads and channels.

use crate::{Result, RlhfError};
use crossbeam_channel::{bounded, Receiver, Sender};
use tch::Tensor;

/// Collective operations used by the accelerator backend.
pub trait DistributedBackend: Send {
    /// Replace `tensor` with its mean over all workers.
    fn all_reduce(&self, tensor: &mut Tensor) -> Result<()>;

    /// Replace `tensor` with rank 0's value.
    fn broadcast(&self, tensor: &mut Tensor) -> Result<()>;

    /// Block until every worker has arrived.
    fn barrier(&self) -> Result<()>;

    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-worker backend, every collective is a no-op.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl DistributedBackend for LocalBackend {
    fn all_reduce(&self, _tensor: &mut Tensor) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _tensor: &mut Tensor) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Channel ends owned by rank 0.
struct MasterLinks {
    // index i holds the link to rank i + 1
    from_workers: Vec<Receiver<Tensor>>,
    to_workers: Vec<Sender<Tensor>>,
    arrivals: Vec<Receiver<()>>,
    releases: Vec<Sender<()>>,
}

/// Channel ends owned by every other rank.
struct WorkerLinks {
    to_master: Sender<Tensor>,
    from_master: Receiver<Tensor>,
    arrive: Sender<()>,
    release: Receiver<()>,
}

enum Links {
    Master(MasterLinks),
    Worker(WorkerLinks),
}

fn disconnected(rank: usize) -> RlhfError {
    RlhfError::Distributed(format!("rank {rank} left the group"))
}

/// One worker of a thread group. Rank 0 reduces and fans results out.
///
/// Each rank owns its channel ends, so a rank that exits (on error or
/// panic) disconnects its peers and their next collective fails instead of
/// blocking.
pub struct ThreadDistributedBackend {
    rank: usize,
    world_size: usize,
    links: Links,
}

impl ThreadDistributedBackend {
    /// One backend per rank of a fresh group.
    pub fn group(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let mut master = MasterLinks {
            from_workers: Vec::with_capacity(world_size - 1),
            to_workers: Vec::with_capacity(world_size - 1),
            arrivals: Vec::with_capacity(world_size - 1),
            releases: Vec::with_capacity(world_size - 1),
        };
        let mut workers = Vec::with_capacity(world_size);

        for rank in 1..world_size {
            let (up_tx, up_rx) = bounded(1);
            let (down_tx, down_rx) = bounded(1);
            let (arrive_tx, arrive_rx) = bounded(1);
            let (release_tx, release_rx) = bounded(1);
            master.from_workers.push(up_rx);
            master.to_workers.push(down_tx);
            master.arrivals.push(arrive_rx);
            master.releases.push(release_tx);
            workers.push(Self {
                rank,
                world_size,
                links: Links::Worker(WorkerLinks {
                    to_master: up_tx,
                    from_master: down_rx,
                    arrive: arrive_tx,
                    release: release_rx,
                }),
            });
        }

        let mut group = Vec::with_capacity(world_size);
        group.push(Self {
            rank: 0,
            world_size,
            links: Links::Master(master),
        });
        group.extend(workers);
        group
    }
}

impl DistributedBackend for ThreadDistributedBackend {
    fn all_reduce(&self, tensor: &mut Tensor) -> Result<()> {
        match &self.links {
            Links::Master(links) => {
                let mut sum = tensor.shallow_clone();
                for (i, rx) in links.from_workers.iter().enumerate() {
                    let grad = rx.recv().map_err(|_| disconnected(i + 1))?;
                    sum = sum + grad.to_device(tensor.device());
                }
                let avg = sum / (self.world_size as f64);

                for (i, tx) in links.to_workers.iter().enumerate() {
                    tx.send(avg.shallow_clone()).map_err(|_| disconnected(i + 1))?;
                }
                *tensor = avg;
            }
            Links::Worker(links) => {
                links
                    .to_master
                    .send(tensor.shallow_clone())
                    .map_err(|_| disconnected(0))?;
                *tensor = links
                    .from_master
                    .recv()
                    .map_err(|_| disconnected(0))?
                    .to_device(tensor.device());
            }
        }
        Ok(())
    }

    fn broadcast(&self, tensor: &mut Tensor) -> Result<()> {
        match &self.links {
            Links::Master(links) => {
                for (i, tx) in links.to_workers.iter().enumerate() {
                    tx.send(tensor.shallow_clone()).map_err(|_| disconnected(i + 1))?;
                }
            }
            Links::Worker(links) => {
                *tensor = links
                    .from_master
                    .recv()
                    .map_err(|_| disconnected(0))?
                    .to_device(tensor.device());
            }
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        match &self.links {
            Links::Master(links) => {
                for (i, rx) in links.arrivals.iter().enumerate() {
                    rx.recv().map_err(|_| disconnected(i + 1))?;
                }
                for (i, tx) in links.releases.iter().enumerate() {
                    tx.send(()).map_err(|_| disconnected(i + 1))?;
                }
            }
            Links::Worker(links) => {
                links.arrive.send(()).map_err(|_| disconnected(0))?;
                links.release.recv().map_err(|_| disconnected(0))?;
            }
        }
        Ok(())
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}
