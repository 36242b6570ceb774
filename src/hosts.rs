//! The bounded pool of known peer addresses.
//!
//! The pool backs the outbound and seed sessions: `take` removes a random
//! unreserved candidate for a connection attempt, `restore` returns an
//! unused candidate, `save` folds in gossiped addresses through the
//! configured filters, and the reservation bit keeps one live channel per
//! authority. A watch channel publishes the pool size so an outbound batch
//! can park on an empty pool instead of spinning.
//!
//! # Correctness
//!
//! The internal mutex is a threaded `std::sync::Mutex` held only for short
//! map operations, never across an await point.

use std::{
    collections::HashSet,
    fs,
    io::Write,
    sync::{Arc, Mutex},
};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::{Authority, Settings},
    protocol::addr::AddressItem,
    Error,
};

struct Inner {
    addresses: Vec<AddressItem>,
    index: HashSet<Authority>,
    reserved: HashSet<Authority>,
}

/// The host pool.
pub struct Hosts {
    settings: Arc<Settings>,
    inner: Mutex<Inner>,
    count_tx: watch::Sender<usize>,
}

impl std::fmt::Debug for Hosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hosts")
            .field("count", &self.count())
            .field("reserved", &self.reserved_count())
            .finish()
    }
}

impl Hosts {
    /// An empty pool with the configured capacity.
    pub fn new(settings: Arc<Settings>) -> Hosts {
        let (count_tx, _) = watch::channel(0);
        Hosts {
            settings,
            inner: Mutex::new(Inner {
                addresses: Vec::new(),
                index: HashSet::new(),
                reserved: HashSet::new(),
            }),
            count_tx,
        }
    }

    fn capacity(&self) -> usize {
        self.settings.host_pool_capacity as usize
    }

    fn publish(&self, inner: &Inner) {
        self.count_tx.send_replace(inner.addresses.len());
    }

    /// Remove and return a random candidate whose authority is unreserved.
    pub fn take(&self) -> Result<AddressItem, Error> {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        let candidates: Vec<usize> = inner
            .addresses
            .iter()
            .enumerate()
            .filter(|(_, item)| !inner.reserved.contains(&item.authority()))
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return Err(Error::AddressNotFound);
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        let item = inner.addresses.swap_remove(pick);
        inner.index.remove(&item.authority());
        self.publish(&inner);
        Ok(item)
    }

    /// Return an unused candidate to the pool.
    pub fn restore(&self, item: &AddressItem) {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        if inner.addresses.len() >= self.capacity() || !inner.index.insert(item.authority()) {
            return;
        }
        inner.addresses.push(*item);
        self.publish(&inner);
    }

    /// A random candidate, without removal.
    pub fn fetch(&self) -> Result<AddressItem, Error> {
        let inner = self.inner.lock().expect("mutex should be unpoisoned");
        if inner.addresses.is_empty() {
            return Err(Error::AddressNotFound);
        }
        let pick = rand::thread_rng().gen_range(0..inner.addresses.len());
        Ok(inner.addresses[pick])
    }

    /// Up to `count` distinct random candidates, for address advertisement.
    pub fn sample(&self, count: usize) -> Vec<AddressItem> {
        let inner = self.inner.lock().expect("mutex should be unpoisoned");
        let amount = count.min(inner.addresses.len());
        rand::seq::index::sample(&mut rand::thread_rng(), inner.addresses.len(), amount)
            .iter()
            .map(|index| inner.addresses[index])
            .collect()
    }

    /// Fold gossiped addresses into the pool, applying the configured
    /// filters, deduplicating, and honoring capacity. Returns the number of
    /// addresses accepted.
    pub fn save(&self, items: &[AddressItem]) -> usize {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        let mut accepted = 0;
        for item in items {
            if inner.addresses.len() >= self.capacity() {
                debug!(
                    dropped = items.len() - accepted,
                    "host pool at capacity, dropping addresses"
                );
                break;
            }
            if self.settings.excluded(item) || !inner.index.insert(item.authority()) {
                continue;
            }
            inner.addresses.push(*item);
            accepted += 1;
        }
        if accepted > 0 {
            self.publish(&inner);
        }
        accepted
    }

    /// Mark an authority as having a live channel.
    ///
    /// Returns false when the authority is already reserved.
    pub fn reserve(&self, authority: Authority) -> bool {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        inner.reserved.insert(authority)
    }

    /// Clear an authority's reservation.
    pub fn unreserve(&self, authority: Authority) {
        let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
        inner.reserved.remove(&authority);
    }

    /// True when the authority has a live channel.
    pub fn reserved(&self, authority: Authority) -> bool {
        let inner = self.inner.lock().expect("mutex should be unpoisoned");
        inner.reserved.contains(&authority)
    }

    /// The number of pooled addresses.
    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .expect("mutex should be unpoisoned")
            .addresses
            .len()
    }

    /// The number of reserved authorities.
    pub fn reserved_count(&self) -> usize {
        self.inner
            .lock()
            .expect("mutex should be unpoisoned")
            .reserved
            .len()
    }

    /// A watch over the pool size, for parking empty-pool consumers.
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    /// Load the hosts cache from `settings.path`. A missing file is an empty
    /// pool; a corrupt file is [`Error::FileLoad`].
    pub fn load(&self) -> Result<(), Error> {
        if self.capacity() == 0 {
            return Ok(());
        }
        let file = self.settings.file();
        let contents = match fs::read_to_string(&file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                warn!(?file, ?err, "failed to read hosts file");
                return Err(Error::FileLoad);
            }
        };

        let mut items = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            items.push(parse_line(line).ok_or(Error::FileLoad)?);
        }

        {
            let mut inner = self.inner.lock().expect("mutex should be unpoisoned");
            for item in items {
                if inner.addresses.len() >= self.capacity() {
                    break;
                }
                if inner.index.insert(item.authority()) {
                    inner.addresses.push(item);
                }
            }
            self.publish(&inner);
        }
        info!(count = self.count(), "loaded hosts file");
        Ok(())
    }

    /// Persist the pool to `settings.path`.
    pub fn store(&self) -> Result<(), Error> {
        if self.capacity() == 0 {
            return Ok(());
        }
        let snapshot = {
            let inner = self.inner.lock().expect("mutex should be unpoisoned");
            inner.addresses.clone()
        };

        let file = self.settings.file();
        let write = || -> std::io::Result<()> {
            let mut out = Vec::with_capacity(snapshot.len() * 48);
            for item in &snapshot {
                writeln!(
                    out,
                    "{} {} {} {}",
                    item.ip, item.port, item.services, item.timestamp
                )?;
            }
            fs::write(&file, out)
        };
        write().map_err(|err| {
            warn!(?file, ?err, "failed to write hosts file");
            Error::FileSave
        })?;
        debug!(count = snapshot.len(), "stored hosts file");
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<AddressItem> {
    let mut fields = line.split_whitespace();
    let ip = fields.next()?.parse().ok()?;
    let port = fields.next()?.parse().ok()?;
    let services = fields.next()?.parse().ok()?;
    let timestamp = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(AddressItem {
        timestamp,
        services,
        ip,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(capacity: u32) -> Arc<Settings> {
        Arc::new(Settings {
            host_pool_capacity: capacity,
            services_minimum: 0,
            invalid_services: 0,
            ..Settings::default()
        })
    }

    fn item(last_octet: u8) -> AddressItem {
        AddressItem {
            timestamp: 1_568_000_000,
            services: 1,
            ip: format!("203.0.113.{last_octet}").parse().expect("ip"),
            port: 8333,
        }
    }

    #[test]
    fn save_deduplicates_and_honors_capacity() {
        let hosts = Hosts::new(settings(2));
        assert_eq!(hosts.save(&[item(1), item(1), item(2), item(3)]), 2);
        assert_eq!(hosts.count(), 2);
        // A duplicate of a pooled authority is rejected even when room opens.
        let taken = hosts.take().expect("take");
        assert_eq!(hosts.save(&[taken]), 1);
    }

    #[test]
    fn save_applies_the_exclusion_filters() {
        let hosts = Hosts::new(Arc::new(Settings {
            host_pool_capacity: 8,
            services_minimum: 1,
            ..Settings::default()
        }));
        let mut starved = item(1);
        starved.services = 0;
        let unspecified = AddressItem {
            timestamp: 0,
            services: 1,
            ip: "0.0.0.0".parse().expect("ip"),
            port: 0,
        };
        assert_eq!(hosts.save(&[starved, unspecified, item(2)]), 1);
        assert_eq!(hosts.count(), 1);
    }

    #[test]
    fn take_skips_reserved_authorities() {
        let hosts = Hosts::new(settings(8));
        hosts.save(&[item(1), item(2)]);

        assert!(hosts.reserve(item(1).authority()));
        assert!(!hosts.reserve(item(1).authority()));

        // Only the unreserved address can come out.
        let taken = hosts.take().expect("take");
        assert_eq!(taken.authority(), item(2).authority());
        assert_eq!(hosts.take(), Err(Error::AddressNotFound));

        hosts.unreserve(item(1).authority());
        assert_eq!(
            hosts.take().expect("take").authority(),
            item(1).authority()
        );
    }

    #[test]
    fn restore_returns_a_taken_address() {
        let hosts = Hosts::new(settings(8));
        hosts.save(&[item(1)]);
        let taken = hosts.take().expect("take");
        assert_eq!(hosts.count(), 0);
        hosts.restore(&taken);
        assert_eq!(hosts.count(), 1);
        // Restoring twice is a no-op.
        hosts.restore(&taken);
        assert_eq!(hosts.count(), 1);
    }

    #[test]
    fn count_watch_reflects_saves() {
        let hosts = Hosts::new(settings(8));
        let rx = hosts.subscribe_count();
        assert_eq!(*rx.borrow(), 0);
        hosts.save(&[item(1), item(2)]);
        assert_eq!(*rx.borrow(), 2);
        let _ = hosts.take().expect("take");
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn sample_is_distinct_and_bounded() {
        let hosts = Hosts::new(settings(8));
        hosts.save(&[item(1), item(2), item(3)]);
        let sampled = hosts.sample(10);
        assert_eq!(sampled.len(), 3);
        let mut authorities: Vec<_> = sampled.iter().map(AddressItem::authority).collect();
        authorities.sort();
        authorities.dedup();
        assert_eq!(authorities.len(), 3);
        assert_eq!(hosts.sample(2).len(), 2);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Arc::new(Settings {
            host_pool_capacity: 8,
            services_minimum: 0,
            path: dir.path().to_path_buf(),
            ..Settings::default()
        });

        let hosts = Hosts::new(settings.clone());
        hosts.save(&[item(1), item(2)]);
        hosts.store().expect("store");

        let reloaded = Hosts::new(settings);
        reloaded.load().expect("load");
        assert_eq!(reloaded.count(), 2);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hosts = Hosts::new(Arc::new(Settings {
            host_pool_capacity: 8,
            path: dir.path().to_path_buf(),
            ..Settings::default()
        }));
        hosts.load().expect("load");
        assert_eq!(hosts.count(), 0);
    }

    #[test]
    fn corrupt_file_is_a_load_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Arc::new(Settings {
            host_pool_capacity: 8,
            path: dir.path().to_path_buf(),
            ..Settings::default()
        });
        fs::write(settings.file(), "not an address line\n").expect("write");
        assert_eq!(Hosts::new(settings).load(), Err(Error::FileLoad));
    }
}
