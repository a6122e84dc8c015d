//! MPI transport for distributed integration.
//!
//! All processes of the communicator run the same [`Coordinator`](crate::distributed::Coordinator)
//! loop; rank 0 refines the mapping and runs the callback.

use mpi::collective::SystemOperation;
use mpi::topology::Communicator;
use mpi::traits::*;

use crate::distributed::Transport;
use crate::error::{Error, Result};

/// A [`Transport`] over an MPI communicator.
pub struct MpiTransport<'a, C: Communicator> {
    world: &'a C,
}

impl<'a, C: Communicator> MpiTransport<'a, C> {
    pub fn new(world: &'a C) -> Self {
        MpiTransport { world }
    }
}

impl<C: Communicator> Transport for MpiTransport<'_, C> {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let local = values.to_vec();
        self.world
            .all_reduce_into(&local[..], values, SystemOperation::sum());
        Ok(())
    }

    fn broadcast(&self, root: usize, values: &mut [f64]) -> Result<()> {
        let root = i32::try_from(root)
            .ok()
            .filter(|&root| root < self.world.size())
            .ok_or_else(|| Error::sync(format!("there is no process with rank {root}")))?;
        self.world.process_at_rank(root).broadcast_into(values);
        Ok(())
    }
}
