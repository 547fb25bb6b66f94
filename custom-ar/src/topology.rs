use crate::error::{CustomArError, Result};
use crate::rank_data::MAX_RANKS;
use crate::types::Rank;

/// Direct-link state between every pair of ranks on this host.
///
/// Built from a per-pair link probe supplied by the caller (how links are
/// discovered is platform specific). The result feeds the `full_nvlink`
/// flag of `init_custom_ar`, which must be the same on every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTopology {
    world_size: usize,
    links: Vec<bool>,
}

impl PeerTopology {
    /// Query `probe(a, b)` once for every unordered pair `a < b`.
    pub fn from_probe<F>(world_size: usize, mut probe: F) -> Result<Self>
    where
        F: FnMut(Rank, Rank) -> Result<bool>,
    {
        if world_size == 0 || world_size > MAX_RANKS {
            return Err(CustomArError::InvalidArgument(format!(
                "world size {world_size} outside 1..={MAX_RANKS}"
            )));
        }
        let mut topo = Self {
            world_size,
            links: vec![false; world_size * world_size],
        };
        for a in 0..world_size {
            topo.links[a * world_size + a] = true;
            for b in a + 1..world_size {
                let up = probe(a as Rank, b as Rank)?;
                topo.links[a * world_size + b] = up;
                topo.links[b * world_size + a] = up;
            }
        }
        tracing::debug!(
            world_size,
            fully_connected = topo.is_fully_connected(),
            "peer topology probed"
        );
        Ok(topo)
    }

    /// Topology where exactly the listed pairs are linked.
    pub fn with_links(world_size: usize, pairs: &[(Rank, Rank)]) -> Result<Self> {
        Self::from_probe(world_size, |a, b| {
            Ok(pairs
                .iter()
                .any(|&(x, y)| (x, y) == (a, b) || (y, x) == (a, b)))
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn linked(&self, a: Rank, b: Rank) -> bool {
        let (a, b) = (a as usize, b as usize);
        a < self.world_size && b < self.world_size && self.links[a * self.world_size + b]
    }

    /// Every pair of ranks has a direct link.
    pub fn is_fully_connected(&self) -> bool {
        self.links.iter().all(|&up| up)
    }

    /// Consecutive ranks `0 -> 1 -> ... -> n-1 -> 0` are directly linked.
    pub fn has_ring(&self) -> bool {
        let n = self.world_size as Rank;
        (0..n).all(|r| self.linked(r, (r + 1) % n))
    }
}
