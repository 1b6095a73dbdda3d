//! # directory
//!
//! The channel directory: a polled, observable snapshot of the channel
//! catalog. The catalog itself (the AQMS metadata database) is an external
//! collaborator reached through the [`ChannelCatalog`] trait; this module
//! owns the polling thread, the mutex-guarded snapshot, and the observer
//! list. Observers are invoked only when a poll actually changes the
//! snapshot (geographic fields compared to 1e-7 degrees, time fields
//! exactly).

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use seis_types::ChannelDescriptor;

use crate::error::{Error, Result};
use crate::now_micros;
use crate::shutdown::Shutdown;

// ── Catalog abstraction ───────────────────────────────────────────────────────

/// The catalog the directory polls. Implementations answer with all rows or
/// only the rows live at the current wall clock.
pub trait ChannelCatalog: Send {
    fn query_all(&mut self) -> Result<Vec<ChannelDescriptor>>;
    fn query_current(&mut self) -> Result<Vec<ChannelDescriptor>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    All,
    Current,
}

/// Outcome of one poll, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Update,
    NoChange,
}

// ── Directory ─────────────────────────────────────────────────────────────────

pub type SubscriptionId = u64;
type ObserverCallback = Box<dyn Fn(&[ChannelDescriptor]) + Send>;

struct DirectoryState {
    snapshot: Vec<ChannelDescriptor>,
    observers: Vec<(SubscriptionId, ObserverCallback)>,
    next_subscription: SubscriptionId,
}

/// Compares two identity-sorted snapshots.
fn snapshots_equal(a: &[ChannelDescriptor], b: &[ChannelDescriptor]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.approx_eq(y))
}

fn sort_snapshot(snapshot: &mut [ChannelDescriptor]) {
    snapshot.sort_by(|a, b| a.identity().cmp(&b.identity()));
}

/// Runs one poll: queries the catalog, and on a real change swaps the
/// snapshot and notifies every observer under the same lock that guards
/// the snapshot. A catalog failure leaves the last good snapshot intact.
fn refresh(
    catalog: &mut dyn ChannelCatalog,
    mode: QueryMode,
    state: &Mutex<DirectoryState>,
) -> Result<Notification> {
    let mut rows = match mode {
        QueryMode::All => catalog.query_all()?,
        QueryMode::Current => catalog.query_current()?,
    };
    sort_snapshot(&mut rows);
    let mut state = state.lock().expect("directory mutex poisoned");
    if snapshots_equal(&state.snapshot, &rows) {
        return Ok(Notification::NoChange);
    }
    state.snapshot = rows;
    for (_, observer) in &state.observers {
        observer(&state.snapshot);
    }
    Ok(Notification::Update)
}

/// The polling channel directory.
pub struct ChannelDirectory {
    state: Arc<Mutex<DirectoryState>>,
    shutdown: Arc<Shutdown>,
    poller: Option<JoinHandle<()>>,
}

impl ChannelDirectory {
    /// Queries the catalog once (startup fails hard on an unreachable
    /// catalog) and then polls it on `polling_interval` from a dedicated
    /// thread.
    pub fn start(
        mut catalog: Box<dyn ChannelCatalog>,
        mode: QueryMode,
        polling_interval: Duration,
    ) -> Result<Self> {
        if polling_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "polling interval must be positive".to_string(),
            ));
        }
        let state = Arc::new(Mutex::new(DirectoryState {
            snapshot: Vec::new(),
            observers: Vec::new(),
            next_subscription: 0,
        }));
        refresh(catalog.as_mut(), mode, &state)?;
        info!(
            channels = state.lock().expect("directory mutex poisoned").snapshot.len(),
            "channel directory primed"
        );
        let shutdown = Shutdown::new();
        let poller = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("channel-directory".to_string())
                .spawn(move || {
                    debug!("channel directory poller starting");
                    loop {
                        if shutdown.wait_timeout(polling_interval) {
                            break;
                        }
                        match refresh(catalog.as_mut(), mode, &state) {
                            Ok(Notification::Update) => {
                                info!("channel directory snapshot updated")
                            }
                            Ok(Notification::NoChange) => {
                                debug!("channel directory unchanged")
                            }
                            Err(e) => warn!("channel directory poll failed: {e}"),
                        }
                    }
                    debug!("channel directory poller leaving");
                })
                .map_err(|e| Error::Communication(format!("failed to spawn poller: {e}")))?
        };
        Ok(Self {
            state,
            shutdown,
            poller: Some(poller),
        })
    }

    /// Copies the current snapshot out under the lock.
    pub fn snapshot(&self) -> Vec<ChannelDescriptor> {
        self.state
            .lock()
            .expect("directory mutex poisoned")
            .snapshot
            .clone()
    }

    /// Registers an observer invoked with each changed snapshot. The
    /// returned token identifies the subscription for [`unsubscribe`].
    ///
    /// [`unsubscribe`]: ChannelDirectory::unsubscribe
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&[ChannelDescriptor]) + Send + 'static,
    {
        let mut state = self.state.lock().expect("directory mutex poisoned");
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().expect("directory mutex poisoned");
        let before = state.observers.len();
        state.observers.retain(|(observer_id, _)| *observer_id != id);
        state.observers.len() != before
    }

    pub fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.poller.take() {
            if handle.join().is_err() {
                warn!("channel directory poller panicked");
            }
        }
    }
}

impl Drop for ChannelDirectory {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── File-backed catalog ───────────────────────────────────────────────────────

/// A catalog read from a TOML channel list. The production deployment
/// points this tier at the read-only metadata database through the same
/// [`ChannelCatalog`] trait; the file form serves local and air-gapped
/// setups and is re-read on every poll so edits show up live.
pub struct FileChannelCatalog {
    path: std::path::PathBuf,
}

#[derive(Debug, Deserialize)]
struct FileChannelRow {
    network: String,
    station: String,
    channel: String,
    #[serde(default)]
    location_code: String,
    sampling_rate: f64,
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    elevation: f64,
    #[serde(default)]
    dip: f64,
    #[serde(default)]
    azimuth: f64,
    #[serde(default)]
    on_date_us: i64,
    #[serde(default = "FileChannelRow::open_ended")]
    off_date_us: i64,
    #[serde(default)]
    load_date_us: i64,
}

#[derive(Debug, Deserialize)]
struct FileChannelList {
    #[serde(default)]
    channels: Vec<FileChannelRow>,
}

impl FileChannelRow {
    fn open_ended() -> i64 {
        i64::MAX
    }

    fn into_descriptor(self) -> ChannelDescriptor {
        ChannelDescriptor {
            network: self.network,
            station: self.station,
            channel: self.channel,
            location_code: self.location_code,
            sampling_rate: self.sampling_rate,
            latitude: self.latitude,
            longitude: self.longitude,
            elevation: self.elevation,
            dip: self.dip,
            azimuth: self.azimuth,
            on_date_us: self.on_date_us,
            off_date_us: self.off_date_us,
            load_date_us: self.load_date_us,
        }
    }
}

impl FileChannelCatalog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<Vec<ChannelDescriptor>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Communication(format!(
                "cannot read channel list {}: {e}",
                self.path.display()
            ))
        })?;
        let list: FileChannelList = toml::from_str(&text).map_err(|e| {
            Error::InvalidArgument(format!(
                "malformed channel list {}: {e}",
                self.path.display()
            ))
        })?;
        let mut rows = Vec::with_capacity(list.channels.len());
        for row in list.channels {
            let descriptor = row.into_descriptor();
            descriptor.validate().map_err(Error::from)?;
            rows.push(descriptor);
        }
        Ok(rows)
    }
}

impl ChannelCatalog for FileChannelCatalog {
    fn query_all(&mut self) -> Result<Vec<ChannelDescriptor>> {
        self.read()
    }

    fn query_current(&mut self) -> Result<Vec<ChannelDescriptor>> {
        let now = now_micros();
        Ok(self
            .read()?
            .into_iter()
            .filter(|c| c.is_live_at(now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(station: &str, latitude: f64) -> ChannelDescriptor {
        ChannelDescriptor {
            network: "UU".to_string(),
            station: station.to_string(),
            channel: "HHZ".to_string(),
            location_code: "01".to_string(),
            sampling_rate: 100.0,
            latitude,
            longitude: -111.0,
            elevation: 1500.0,
            dip: -90.0,
            azimuth: 0.0,
            on_date_us: 0,
            off_date_us: i64::MAX,
            load_date_us: 0,
        }
    }

    struct MemoryCatalog {
        rows: Arc<Mutex<Vec<ChannelDescriptor>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl ChannelCatalog for MemoryCatalog {
        fn query_all(&mut self) -> Result<Vec<ChannelDescriptor>> {
            if *self.fail.lock().unwrap() {
                return Err(Error::Backend {
                    code: -1,
                    context: "catalog unreachable".to_string(),
                });
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        fn query_current(&mut self) -> Result<Vec<ChannelDescriptor>> {
            let now = now_micros();
            Ok(self
                .query_all()?
                .into_iter()
                .filter(|c| c.is_live_at(now))
                .collect())
        }
    }

    #[test]
    fn observers_fire_only_on_real_changes() {
        let rows = Arc::new(Mutex::new(vec![descriptor("CVRU", 38.92)]));
        let fail = Arc::new(Mutex::new(false));
        let mut catalog = MemoryCatalog {
            rows: rows.clone(),
            fail: fail.clone(),
        };
        let state = Mutex::new(DirectoryState {
            snapshot: Vec::new(),
            observers: Vec::new(),
            next_subscription: 0,
        });
        let notifications = Arc::new(AtomicUsize::new(0));
        {
            let notifications = notifications.clone();
            state.lock().unwrap().observers.push((
                0,
                Box::new(move |_| {
                    notifications.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        // First poll installs the snapshot.
        assert_eq!(
            refresh(&mut catalog, QueryMode::All, &state).unwrap(),
            Notification::Update
        );
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // Identical poll: silent.
        assert_eq!(
            refresh(&mut catalog, QueryMode::All, &state).unwrap(),
            Notification::NoChange
        );
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // Sub-tolerance geographic drift: still silent.
        rows.lock().unwrap()[0].latitude += 0.5e-7;
        assert_eq!(
            refresh(&mut catalog, QueryMode::All, &state).unwrap(),
            Notification::NoChange
        );

        // A real change notifies.
        rows.lock().unwrap().push(descriptor("WPUT", 39.5));
        assert_eq!(
            refresh(&mut catalog, QueryMode::All, &state).unwrap(),
            Notification::Update
        );
        assert_eq!(notifications.load(Ordering::SeqCst), 2);

        // A failing catalog keeps the last good snapshot.
        *fail.lock().unwrap() = true;
        assert!(refresh(&mut catalog, QueryMode::All, &state).is_err());
        assert_eq!(state.lock().unwrap().snapshot.len(), 2);
    }

    #[test]
    fn directory_lifecycle_with_subscriptions() {
        let rows = Arc::new(Mutex::new(vec![descriptor("CVRU", 38.92)]));
        let catalog = MemoryCatalog {
            rows: rows.clone(),
            fail: Arc::new(Mutex::new(false)),
        };
        let mut directory = ChannelDirectory::start(
            Box::new(catalog),
            QueryMode::All,
            Duration::from_secs(3600),
        )
        .unwrap();
        assert_eq!(directory.snapshot().len(), 1);
        let id = directory.subscribe(|_| {});
        assert!(directory.unsubscribe(id));
        assert!(!directory.unsubscribe(id));
        directory.stop();
    }

    #[test]
    fn startup_fails_on_unreachable_catalog() {
        let catalog = MemoryCatalog {
            rows: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(Mutex::new(true)),
        };
        let result = ChannelDirectory::start(
            Box::new(catalog),
            QueryMode::Current,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn file_catalog_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "seismon-catalog-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("channels.toml");
        std::fs::write(
            &path,
            r#"
[[channels]]
network = "UU"
station = "CVRU"
channel = "HHZ"
location_code = "01"
sampling_rate = 100.0
latitude = 38.92
longitude = -111.17
elevation = 2125.0

[[channels]]
network = "UU"
station = "OLD"
channel = "EHZ"
location_code = "01"
sampling_rate = 100.0
latitude = 40.0
longitude = -111.5
on_date_us = 0
off_date_us = 1000
"#,
        )
        .unwrap();
        let mut catalog = FileChannelCatalog::new(&path);
        assert_eq!(catalog.query_all().unwrap().len(), 2);
        // The expired epoch drops out of the live view.
        let current = catalog.query_current().unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].station, "CVRU");
        std::fs::remove_dir_all(&dir).ok();
    }
}
