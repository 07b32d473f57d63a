use std::collections::BTreeMap;
use std::sync::Weak;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::DownloaderStatus;
use crate::block_range::BlockRange;

/// Emitted after a reorganization was repaired. Every block from
/// `first_changed_block` on was replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorgEvent {
    pub first_changed_block: u64,
}

pub(crate) type NewBlocksHandler = Box<dyn FnMut(BlockRange) + Send>;
pub(crate) type ReorgHandler = Box<dyn FnMut(ReorgEvent) + Send>;

pub(crate) enum Delivery {
    /// Waiting for its backfill. Live ranges are merged into `buffered`.
    /// `first_changed` is the lowest fork point of the reorganizations
    /// repaired meanwhile; the backfill is stale from there on.
    Pending {
        buffered: BlockRange,
        first_changed: Option<u64>,
    },
    Live,
}

impl Delivery {
    pub(crate) fn pending() -> Self {
        Self::Pending {
            buffered: BlockRange::default(),
            first_changed: None,
        }
    }
}

struct NewBlocksSubscriber {
    handler: NewBlocksHandler,
    delivery: Delivery,
}

/// Downloader status and subscribers, kept under one lock so that a range
/// is never delivered out of order with the status it produced.
pub(crate) struct Registry {
    pub(crate) status: DownloaderStatus,
    next_id: u64,
    new_blocks: BTreeMap<u64, NewBlocksSubscriber>,
    reorgs: BTreeMap<u64, ReorgHandler>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            status: DownloaderStatus::NotStarted,
            next_id: 0,
            new_blocks: BTreeMap::new(),
            reorgs: BTreeMap::new(),
        }
    }
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn add_new_blocks(&mut self, handler: NewBlocksHandler, delivery: Delivery) -> u64 {
        let id = self.next_id();
        self.new_blocks
            .insert(id, NewBlocksSubscriber { handler, delivery });
        id
    }

    pub(crate) fn add_reorg(&mut self, handler: ReorgHandler) -> u64 {
        let id = self.next_id();
        self.reorgs.insert(id, handler);
        id
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.new_blocks.remove(&id);
        self.reorgs.remove(&id);
    }

    pub(crate) fn emit_new_blocks(&mut self, range: &BlockRange) {
        for subscriber in self.new_blocks.values_mut() {
            match &mut subscriber.delivery {
                Delivery::Live => (subscriber.handler)(range.clone()),
                Delivery::Pending { buffered, .. } => *buffered = buffered.merge(range),
            }
        }
    }

    pub(crate) fn emit_reorg(&mut self, event: ReorgEvent) {
        let fork = event.first_changed_block;
        for subscriber in self.new_blocks.values_mut() {
            if let Delivery::Pending {
                buffered,
                first_changed,
            } = &mut subscriber.delivery
            {
                *buffered = buffered.truncate(fork);
                *first_changed = Some(first_changed.map_or(fork, |known| known.min(fork)));
            }
        }
        for handler in self.reorgs.values_mut() {
            handler(event);
        }
    }

    /// Delivers `backfill` together with whatever was buffered meanwhile and
    /// switches the subscriber to live delivery. Backfilled blocks replaced
    /// by a reorganization since the backfill was read are left out.
    pub(crate) fn go_live(&mut self, id: u64, backfill: BlockRange) {
        let head_end = match self.status {
            DownloaderStatus::Working { last_known_block } => last_known_block.number + 1,
            DownloaderStatus::NotStarted => return,
        };
        let Some(subscriber) = self.new_blocks.get_mut(&id) else {
            return;
        };
        let range = match std::mem::replace(&mut subscriber.delivery, Delivery::Live) {
            Delivery::Pending {
                buffered,
                first_changed,
            } => {
                let backfill = match first_changed {
                    Some(fork) => backfill.truncate(fork),
                    None => backfill,
                };
                backfill.merge(&buffered).truncate(head_end)
            }
            Delivery::Live => return,
        };
        if !range.is_empty() {
            (subscriber.handler)(range);
        }
    }
}

/// Handle returned for every registered handler.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(registry: Weak<Mutex<Registry>>, id: u64) -> Self {
        Self { registry, id }
    }

    /// Removes the handler. It is not called again, not even with a
    /// backfill that is still being loaded.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::known;

    fn working(head: u64) -> Registry {
        Registry {
            status: DownloaderStatus::Working {
                last_known_block: known("a", head),
            },
            ..Registry::default()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<BlockRange>>>, NewBlocksHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |range| sink.lock().push(range)))
    }

    #[test]
    fn pending_subscriber_gets_backfill_and_buffer_once() {
        let mut registry = working(7);
        let (seen, handler) = recorder();
        let id = registry.add_new_blocks(handler, Delivery::pending());

        registry.emit_new_blocks(&BlockRange::from_blocks([known("a", 6), known("a", 7)]));
        assert!(seen.lock().is_empty());

        let backfill = BlockRange::from_blocks((3..=5).map(|n| known("a", n)));
        registry.go_live(id, backfill);
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!((seen[0].start(), seen[0].end()), (3, 8));
        }

        registry.emit_new_blocks(&BlockRange::from_blocks([known("a", 8)]));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn buffered_reorg_overrides_backfill_hashes() {
        let mut registry = working(6);
        let (seen, handler) = recorder();
        let id = registry.add_new_blocks(handler, Delivery::pending());

        registry.emit_new_blocks(&BlockRange::from_blocks([known("b", 5), known("b", 6)]));
        registry.go_live(id, BlockRange::from_blocks((3..=5).map(|n| known("a", n))));

        let delivered = seen.lock()[0].clone();
        assert_eq!(delivered.hash(4), Some(known("a", 4).hash));
        assert_eq!(delivered.hash(5), Some(known("b", 5).hash));
        assert_eq!(delivered.end(), 7);
    }

    #[test]
    fn reorg_while_pending_drops_replaced_blocks() {
        let mut registry = working(10);
        let (seen, handler) = recorder();
        let id = registry.add_new_blocks(handler, Delivery::pending());

        registry.emit_new_blocks(&BlockRange::from_blocks([known("a", 11)]));
        registry.status = DownloaderStatus::Working {
            last_known_block: known("b", 9),
        };
        registry.emit_reorg(ReorgEvent {
            first_changed_block: 8,
        });
        registry.emit_new_blocks(&BlockRange::from_blocks([known("b", 8), known("b", 9)]));
        registry.go_live(id, BlockRange::from_blocks((6..=10).map(|n| known("a", n))));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!((seen[0].start(), seen[0].end()), (6, 10));
        assert_eq!(seen[0].hash(7), Some(known("a", 7).hash));
        assert_eq!(seen[0].hash(8), Some(known("b", 8).hash));
        assert_eq!(seen[0].hash(9), Some(known("b", 9).hash));
        assert_eq!(seen[0].hash(10), None);
    }

    #[test]
    fn removed_pending_subscriber_is_not_called() {
        let registry = Arc::new(Mutex::new(working(2)));
        let (seen, handler) = recorder();
        let id = registry.lock().add_new_blocks(handler, Delivery::pending());

        Subscription::new(Arc::downgrade(&registry), id).unsubscribe();
        registry
            .lock()
            .go_live(id, BlockRange::from_blocks([known("a", 1)]));
        registry
            .lock()
            .emit_new_blocks(&BlockRange::from_blocks([known("a", 2)]));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn reorg_handlers_are_called() {
        let mut registry = Registry::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let id = registry.add_reorg(Box::new(move |event| sink.lock().push(event)));

        registry.emit_reorg(ReorgEvent {
            first_changed_block: 4,
        });
        registry.remove(id);
        registry.emit_reorg(ReorgEvent {
            first_changed_block: 5,
        });
        assert_eq!(
            *events.lock(),
            vec![ReorgEvent {
                first_changed_block: 4
            }]
        );
    }
}
