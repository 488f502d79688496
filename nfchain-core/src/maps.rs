//! Pinned-map gateway between the supervisor and the kernel.
//!
//! Every operation reopens the pinned map for the duration of the call;
//! raw descriptors are never cached across operations, since a program
//! restart would leave them pointing at a dead map.
//!
//! Slot 0 of a next-program map holds the file descriptor of the successor
//! program, written by the supervisor and read back as a program ID.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use libbpf_rs::{MapCore, MapFlags, MapHandle, MapType};
use log::{debug, info};
use nfchain_common::types::{kernel_name, Aggregator};
use nfchain_common::{Error, Result};

/// Chain slot maintained by the supervisor in every next-program map.
const NEXT_PROG_SLOT: u32 = 0;

/// Identity of a pinned or enumerated eBPF map.
///
/// `owner` is the owning program's name, kept for logging only.
#[derive(Debug, Clone)]
pub struct BpfMap {
    pub name: String,
    pub id: u32,
    pub map_type: MapType,
    pub owner: String,
}

fn open(path: &Path) -> Result<MapHandle> {
    MapHandle::from_pinned_path(path).map_err(|e| {
        Error::ChainIntegrity(format!("unable to access pinned map {}: {e}", path.display()))
    })
}

fn open_by_id(id: u32) -> Result<MapHandle> {
    MapHandle::from_map_id(id)
        .map_err(|e| Error::ChainIntegrity(format!("unable to open map id {id}: {e}")))
}

/// Open a map pinned at `path`. TC programs pin their config maps, so this
/// is how their maps are found.
pub fn open_pinned(path: &Path, owner: &str) -> Result<BpfMap> {
    let handle = open(path)?;
    let info = handle
        .info()
        .map_err(|e| Error::ChainIntegrity(format!("fetching map info failed: {e}")))?;

    let map = BpfMap {
        name: path.display().to_string(),
        id: info.info.id,
        map_type: handle.map_type(),
        owner: owner.to_string(),
    };
    info!("added map id {} name {} type {:?}", map.id, map.name, map.map_type);
    Ok(map)
}

/// Find a loaded map by name. XDP programs may not pin their config maps,
/// so the kernel's map ID space is walked instead; the kernel truncates
/// map names to 15 bytes and the comparison follows suit.
pub fn find_by_name(name: &str, owner: &str) -> Result<BpfMap> {
    let truncated = kernel_name(name);
    for entry in libbpf_rs::query::MapInfoIter::default() {
        if entry.name.to_string_lossy() == truncated {
            let map = BpfMap {
                name: name.to_string(),
                id: entry.id,
                map_type: entry.ty,
                owner: owner.to_string(),
            };
            info!("added map id {} name {} type {:?}", map.id, map.name, map.map_type);
            return Ok(map);
        }
    }
    Err(Error::ChainIntegrity(format!("no loaded map named {truncated}")))
}

/// Resolve a program ID to a file descriptor owned by this process.
fn prog_fd(prog_id: u32) -> Result<OwnedFd> {
    let fd = unsafe { libbpf_sys::bpf_prog_get_fd_by_id(prog_id) };
    if fd < 0 {
        return Err(Error::ChainIntegrity(format!(
            "program ID {prog_id} is not loaded: {}",
            std::io::Error::from_raw_os_error(-fd)
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Write the program fd for `prog_id` into slot 0 of the pinned map.
pub fn put_slot0_fd(map_path: &Path, prog_id: u32) -> Result<()> {
    let handle = open(map_path)?;
    let fd = prog_fd(prog_id)?;
    let raw = fd.as_raw_fd() as u32;
    debug!("writing fd {raw} for prog {prog_id} into {}", map_path.display());
    handle
        .update(&NEXT_PROG_SLOT.to_ne_bytes(), &raw.to_ne_bytes(), MapFlags::ANY)
        .map_err(|e| {
            Error::ChainIntegrity(format!(
                "unable to update next prog map {}: {e}",
                map_path.display()
            ))
        })
}

/// Read the program ID recorded at slot 0 and validate it against the
/// kernel; an ID the kernel no longer resolves is rejected.
pub fn slot0_prog_id(map_path: &Path) -> Result<u32> {
    let handle = open(map_path)?;
    let value = handle
        .lookup(&NEXT_PROG_SLOT.to_ne_bytes(), MapFlags::ANY)
        .map_err(|e| {
            Error::ChainIntegrity(format!("unable to lookup prog map {}: {e}", map_path.display()))
        })?
        .ok_or_else(|| {
            Error::ChainIntegrity(format!("prog map {} has no slot 0 entry", map_path.display()))
        })?;

    let prog_id = match value.as_slice() {
        [a, b, c, d, ..] => u32::from_ne_bytes([*a, *b, *c, *d]),
        _ => {
            return Err(Error::ChainIntegrity(format!(
                "prog map {} slot 0 holds a short value",
                map_path.display()
            )))
        }
    };

    prog_fd(prog_id)?;
    Ok(prog_id)
}

/// Best-effort delete of slot 0; an already-empty map is not an error.
pub fn delete_slot0(map_path: &Path) -> Result<()> {
    let handle = open(map_path)?;
    if let Err(e) = handle.delete(&NEXT_PROG_SLOT.to_ne_bytes()) {
        debug!("delete of slot 0 in {} skipped: {e}", map_path.display());
    }
    Ok(())
}

/// True while the kernel still resolves the map ID.
pub fn map_id_exists(id: u32) -> bool {
    MapHandle::from_map_id(id).is_ok()
}

/// Read the integer value at `key` from the map identified by `id`.
pub fn read_slot(id: u32, key: u32) -> Result<u64> {
    let handle = open_by_id(id)?;
    let value = handle
        .lookup(&key.to_ne_bytes(), MapFlags::ANY)
        .map_err(|e| Error::ChainIntegrity(format!("unable to lookup map id {id}: {e}")))?
        .ok_or_else(|| Error::ChainIntegrity(format!("map id {id} has no entry at key {key}")))?;

    match value.as_slice() {
        [a, b, c, d, e, f, g, h, ..] => Ok(u64::from_ne_bytes([*a, *b, *c, *d, *e, *f, *g, *h])),
        [a, b, c, d] => Ok(u32::from_ne_bytes([*a, *b, *c, *d]) as u64),
        _ => Err(Error::ChainIntegrity(format!(
            "map id {id} holds a short value at key {key}"
        ))),
    }
}

/// Write a config value into key 0 of the map, verbatim.
///
/// The submitted value's raw bytes are fitted to the map's fixed value
/// width (see [`encode_value`]), so the program reads back exactly what
/// the operator submitted — an address like `1.2.3.4` stays an address.
pub fn update_values(map: &BpfMap, value: &str) -> Result<()> {
    let handle = open_by_id(map.id)?;
    let bytes = encode_value(value.as_bytes(), handle.value_size() as usize);
    debug!("writing {} bytes into map {} key 0", bytes.len(), map.name);
    handle
        .update(&0u32.to_ne_bytes(), &bytes, MapFlags::ANY)
        .map_err(|e| Error::ChainIntegrity(format!("unable to update map {}: {e}", map.name)))
}

/// Fit raw value bytes to a map's fixed value width: zero-padded when
/// shorter, truncated when longer.
fn encode_value(value: &[u8], value_size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; value_size];
    let n = value.len().min(value_size);
    bytes[..n].copy_from_slice(&value[..n]);
    bytes
}

/* ---------------------------------------------------------------- *
 * Metric sampling
 * ---------------------------------------------------------------- */

/// Bounded ring of the most recent readings of one metric slot.
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Collapse the ring into one value.
    ///
    /// `max-rate` treats the samples as a monotonic counter and reports
    /// the largest increase between adjacent readings, per interval.
    pub fn aggregate(&self, aggregator: Aggregator) -> f64 {
        match aggregator {
            Aggregator::Sum => self.samples.iter().sum::<u64>() as f64,
            Aggregator::Avg => {
                if self.samples.is_empty() {
                    0.0
                } else {
                    self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
                }
            }
            Aggregator::MaxRate => self
                .samples
                .iter()
                .zip(self.samples.iter().skip(1))
                .map(|(prev, next)| next.saturating_sub(*prev))
                .max()
                .unwrap_or(0) as f64,
        }
    }
}

/// One monitored map slot plus its sample history.
#[derive(Debug)]
pub struct MetricsMap {
    pub map: BpfMap,
    pub key: u32,
    pub aggregator: Aggregator,
    ring: SampleRing,
}

impl MetricsMap {
    pub fn new(map: BpfMap, key: u32, aggregator: Aggregator, samples_length: usize) -> Self {
        Self {
            map,
            key,
            aggregator,
            ring: SampleRing::new(samples_length),
        }
    }

    /// Read the current value, append it to the ring and return the
    /// aggregate over the retained samples.
    pub fn sample(&mut self) -> Result<f64> {
        let value = read_slot(self.map.id, self.key)?;
        self.ring.push(value);
        Ok(self.ring.aggregate(self.aggregator))
    }
}
