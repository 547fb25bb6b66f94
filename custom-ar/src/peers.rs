use crate::error::{CustomArError, Result};
use crate::ipc::{IpcHandle, IpcTransport, PeerMapping};
use crate::rank_data::{RANK_DATA_ALIGN, RankData, meta_size};
use crate::types::Rank;

/// Mapped Rank Data of every peer, indexed by rank.
///
/// Owns the mappings until [`PeerHandles::close_all`]; the local rank's own
/// region is never mapped and its entry has no mapping.
pub(crate) struct PeerHandles {
    rank: usize,
    mappings: Vec<Option<PeerMapping>>,
    views: Vec<RankData>,
}

impl PeerHandles {
    /// Map every peer descriptor. On failure, mappings opened so far are
    /// closed again before the error is returned.
    pub(crate) fn open(
        transport: &dyn IpcTransport,
        descriptors: &[IpcHandle],
        rank: usize,
        own: RankData,
    ) -> Result<Self> {
        let world = descriptors.len();
        let mut handles = Self {
            rank,
            mappings: Vec::with_capacity(world),
            views: Vec::with_capacity(world),
        };

        for (peer, descriptor) in descriptors.iter().enumerate() {
            if peer == rank {
                handles.mappings.push(None);
                handles.views.push(own);
                continue;
            }
            let mapping = match Self::open_one(transport, descriptor, peer, world) {
                Ok(m) => m,
                Err(e) => {
                    if let Err(close_err) = handles.close_all(transport) {
                        tracing::warn!(rank, error = %close_err, "failed to unwind peer mappings");
                    }
                    return Err(e);
                }
            };
            handles.views.push(unsafe { RankData::new(mapping.ptr(), world) });
            handles.mappings.push(Some(mapping));
        }
        Ok(handles)
    }

    fn open_one(
        transport: &dyn IpcTransport,
        descriptor: &IpcHandle,
        peer: usize,
        world: usize,
    ) -> Result<PeerMapping> {
        let mapping = transport.open(descriptor).map_err(|e| {
            CustomArError::initialization(format!("cannot map rank data of peer {peer}: {e}"))
        })?;
        let problem = if mapping.len() < meta_size(world) {
            Some(format!(
                "rank data of peer {peer} is {} bytes, need {}",
                mapping.len(),
                meta_size(world)
            ))
        } else if mapping.ptr() % RANK_DATA_ALIGN as u64 != 0 {
            Some(format!("rank data of peer {peer} is misaligned"))
        } else {
            None
        };
        match problem {
            None => Ok(mapping),
            Some(reason) => {
                transport.close(mapping)?;
                Err(CustomArError::initialization(reason))
            }
        }
    }

    pub(crate) fn views(&self) -> &[RankData] {
        &self.views
    }

    /// Fail with `PeerUnavailable` if any peer's Rank Data export is gone.
    pub(crate) fn check_alive(&self, transport: &dyn IpcTransport) -> Result<()> {
        for (peer, mapping) in self.mappings.iter().enumerate() {
            if let Some(m) = mapping
                && !transport.is_alive(m)
            {
                return Err(CustomArError::PeerUnavailable {
                    rank: peer as Rank,
                    reason: "rank data mapping lost".into(),
                });
            }
        }
        Ok(())
    }

    /// Close every open mapping. Keeps going after a failure and reports the
    /// first one.
    pub(crate) fn close_all(&mut self, transport: &dyn IpcTransport) -> Result<()> {
        let mut first_err = None;
        for mapping in self.mappings.iter_mut().filter_map(Option::take) {
            if let Err(e) = transport.close(mapping) {
                first_err.get_or_insert(e);
            }
        }
        tracing::trace!(rank = self.rank, "peer rank data unmapped");
        first_err.map_or(Ok(()), Err)
    }
}
