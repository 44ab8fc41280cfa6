//! Rank topology resolution
//!
//! Partitions the flat global group into a two-level hierarchy: ranks that
//! share a host identifier form an intra-host group, and the first rank of
//! each host (by global rank) represents it in the inter-host group. Every
//! process resolves the same assignment because the grouping is a pure
//! function of the allgathered host identifiers.

use crate::error::{Error, Result};
use crate::transport::Group;

/// This process's position in the two-level hierarchy. Immutable once
/// resolved; a communicator resolves it exactly once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Position among co-located ranks, contiguous in `[0, intra_size)`.
    pub intra_rank: usize,
    /// Number of ranks sharing this process's host.
    pub intra_size: usize,
    /// Index of this process's host among all hosts, ordered by the global
    /// rank of each host's representative. For the representative itself
    /// (`intra_rank == 0`) this is its rank within the inter-host group.
    pub inter_rank: usize,
    /// Number of distinct hosts.
    pub inter_size: usize,

    intra_members: Vec<usize>,
    representatives: Vec<usize>,
}

impl Topology {
    /// Resolve the calling process's topology by exchanging host identifiers
    /// over `world`. Host discovery failures surface as transport errors and
    /// are not retried.
    pub fn resolve(world: &Group) -> Result<Self> {
        let host = world.transport().host_id()?;
        let frames = world.allgather_bytes(host.into_bytes())?;
        let hosts = frames
            .into_iter()
            .map(|f| {
                String::from_utf8(f)
                    .map_err(|_| Error::Protocol("host identifier is not valid UTF-8".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_hosts(&hosts, world.rank()))
    }

    /// Pure assignment from the full host list; `me` is the global rank.
    fn from_hosts(hosts: &[String], me: usize) -> Self {
        let my_host = &hosts[me];
        let intra_members: Vec<usize> =
            (0..hosts.len()).filter(|&r| hosts[r] == *my_host).collect();
        // Members are ascending, so this process's position among them is
        // the count of co-located ranks below it.
        let intra_rank = intra_members.iter().filter(|&&r| r < me).count();

        // One representative per host: the first rank, in global order, to
        // carry each host identifier.
        let mut seen: Vec<&String> = Vec::new();
        let mut representatives = Vec::new();
        for (r, h) in hosts.iter().enumerate() {
            if !seen.contains(&h) {
                seen.push(h);
                representatives.push(r);
            }
        }
        let my_rep = intra_members[0];
        let inter_rank = representatives.iter().filter(|&&r| r < my_rep).count();

        Self {
            intra_rank,
            intra_size: intra_members.len(),
            inter_rank,
            inter_size: representatives.len(),
            intra_members,
            representatives,
        }
    }

    /// Global ranks co-located with this process, ascending.
    pub fn intra_members(&self) -> &[usize] {
        &self.intra_members
    }

    /// Global ranks of the per-host representatives, ascending.
    pub fn representatives(&self) -> &[usize] {
        &self.representatives
    }

    /// Whether this process represents its host in the inter-host group.
    pub fn is_representative(&self) -> bool {
        self.intra_rank == 0
    }
}
