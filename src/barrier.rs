use crate::error::{DartError, DartResult};
use crate::transport::{CollKey, Transport, TransportColl, TransportMem, TransportRdma};

use std::sync::atomic::{AtomicU64, Ordering};

const SLOT: usize = std::mem::size_of::<u64>();

/// Epoch barrier over a window with one `u64` slot per team member.
///
/// Entering epoch `e` stores `e` into the caller's slot on every member; a
/// member has passed `e` once every slot in its own window holds at least `e`.
#[derive(Debug)]
pub(crate) struct Barrier {
    my_idx: usize,
    epoch: AtomicU64,
    window: usize,
    peers: Vec<usize>,
}

impl Barrier {
    /// Collective over `members` (global ids) identified by `key`.
    pub(crate) fn new(
        transport: &Transport,
        key: CollKey,
        members: &[usize],
        my_idx: usize,
    ) -> DartResult<Barrier> {
        let window = transport.alloc(members.len() * SLOT)?;
        let gathered = transport.allgather(key, members, (window as u64).to_le_bytes().to_vec())?;
        let mut peers = Vec::with_capacity(members.len());
        for (unit, bytes) in members.iter().zip(gathered) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            let addr = u64::from_le_bytes(raw) as usize;
            match transport.local_addr(*unit, addr) {
                Some(addr) => peers.push(addr),
                None => {
                    return Err(DartError::CommunicationFailure(format!(
                        "barrier window of unit {} is not mapped",
                        unit
                    )))
                }
            }
        }
        Ok(Barrier {
            my_idx,
            epoch: AtomicU64::new(0),
            window,
            peers,
        })
    }

    fn slot(base: usize, idx: usize) -> &'static AtomicU64 {
        // slots live in registered memory that outlives every barrier epoch
        unsafe { &*((base + idx * SLOT) as *const AtomicU64) }
    }

    /// Enter the next epoch without waiting.
    pub(crate) fn start(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for peer in &self.peers {
            Barrier::slot(*peer, self.my_idx).store(epoch, Ordering::Release);
        }
        tracing::trace!("barrier entered epoch {}", epoch);
        epoch
    }

    pub(crate) fn test(&self, epoch: u64) -> bool {
        (0..self.peers.len()).all(|idx| Barrier::slot(self.window, idx).load(Ordering::Acquire) >= epoch)
    }

    pub(crate) fn release(&self, transport: &Transport) -> DartResult<()> {
        transport.free(self.window)
    }

    pub(crate) fn print_bar(&self) {
        let vals = (0..self.peers.len())
            .map(|idx| Barrier::slot(self.window, idx).load(Ordering::Relaxed))
            .collect::<Vec<_>>();
        println!("[DART BARRIER] idx {} {:?}", self.my_idx, vals);
    }
}
