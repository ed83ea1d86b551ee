//! Seismic station inventory.
//!
//! A [`Station`] is a [`Location`] plus its network/station/location code
//! triple (NSL). The [`Stations`] collection resolves inline definitions
//! and file references, drops duplicates and zero-coordinate entries, and
//! carries a blacklist of NSL codes that iteration and counting exclude.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{QSeekError, Result};
use crate::geo::Location;

/// Maximum lengths of the NSL code components.
const MAX_NETWORK_LEN: usize = 2;
const MAX_STATION_LEN: usize = 5;
const MAX_LOCATION_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub network: String,
    pub station: String,
    #[serde(rename = "location", default)]
    pub location_code: String,
    #[serde(flatten)]
    pub coords: Location,
}

impl Station {
    /// Network-station-location code as a dotted string, e.g. `GR.GRA1.`.
    pub fn nsl(&self) -> String {
        format!("{}.{}.{}", self.network, self.station, self.location_code)
    }

    pub fn effective_depth(&self) -> f64 {
        self.coords.effective_depth()
    }

    pub fn distance_to(&self, location: &Location) -> f64 {
        self.coords.distance_to(location)
    }

    fn validate_codes(&self) -> Result<()> {
        let check = |value: &str, max_len: usize, what: &str| -> Result<()> {
            if value.len() > max_len || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(QSeekError::config(format!(
                    "station {} has invalid {what} code {value:?}",
                    self.nsl()
                )));
            }
            Ok(())
        };
        check(&self.network, MAX_NETWORK_LEN, "network")?;
        check(&self.station, MAX_STATION_LEN, "station")?;
        check(&self.location_code, MAX_LOCATION_LEN, "location")?;
        Ok(())
    }
}

/// Station inventory with blacklist support.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stations {
    /// JSON files holding additional station lists.
    #[serde(default)]
    pub station_files: Vec<PathBuf>,

    /// Inline station definitions.
    #[serde(default)]
    pub stations: Vec<Station>,

    /// NSL codes excluded from detection, format `NET.STA.LOC`.
    #[serde(default)]
    pub blacklist: BTreeSet<String>,

    #[serde(skip)]
    resolved: bool,
}

impl Stations {
    /// Inventory from an inline station list; call [`Self::load`] to weed
    /// and validate it.
    pub fn from_stations(stations: Vec<Station>) -> Self {
        Self {
            stations,
            ..Default::default()
        }
    }

    /// Resolve file references and weed the inventory.
    ///
    /// Duplicate NSL codes and stations with zero coordinates are dropped
    /// with a warning. Fails if any referenced file is missing or no usable
    /// station remains.
    pub fn load(&mut self) -> Result<()> {
        if self.resolved {
            return Ok(());
        }
        for file in &self.station_files {
            let text = fs::read_to_string(file).map_err(|e| {
                QSeekError::data(format!("cannot read station file {}: {e}", file.display()))
            })?;
            let loaded: Vec<Station> = serde_json::from_str(&text).map_err(|e| {
                QSeekError::data(format!("bad station file {}: {e}", file.display()))
            })?;
            self.stations.extend(loaded);
        }

        self.weed()?;
        for station in &self.stations {
            station.validate_codes()?;
        }
        if self.iter().count() == 0 {
            return Err(QSeekError::data(
                "no stations available, add stations to start detection",
            ));
        }
        self.resolved = true;
        Ok(())
    }

    /// Remove stations with bad coordinates and duplicate NSL codes.
    fn weed(&mut self) -> Result<()> {
        debug!("weeding bad stations");
        let mut seen_nsls: BTreeSet<String> = BTreeSet::new();
        let mut kept = Vec::with_capacity(self.stations.len());

        for station in self.stations.drain(..) {
            if station.coords.lat == 0.0 && station.coords.lon == 0.0
                && station.coords.east_shift == 0.0
                && station.coords.north_shift == 0.0
            {
                warn!("removing station {}: bad coordinates", station.nsl());
                continue;
            }
            if !seen_nsls.insert(station.nsl()) {
                warn!("removing duplicate station {}", station.nsl());
                continue;
            }
            kept.push(station);
        }
        self.stations = kept;
        Ok(())
    }

    /// Iterate stations, skipping blacklisted entries.
    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.stations
            .iter()
            .filter(|sta| !self.blacklist.contains(&sta.nsl()))
    }

    /// Number of usable (non-blacklisted) stations.
    pub fn n_stations(&self) -> usize {
        self.iter().count()
    }

    /// Blacklist a station, e.g. when it falls outside a velocity model.
    pub fn blacklist_station(&mut self, nsl: &str, reason: &str) -> Result<()> {
        warn!("blacklisting station {nsl}: {reason}");
        self.blacklist.insert(nsl.to_string());
        if self.n_stations() == 0 {
            return Err(QSeekError::data(
                "no stations available, all stations blacklisted",
            ));
        }
        Ok(())
    }

    /// All usable NSL codes, in iteration order.
    pub fn all_nsls(&self) -> Vec<String> {
        self.iter().map(Station::nsl).collect()
    }

    /// Select stations matching the given NSL codes, preserving their order.
    pub fn select_from_nsls(&self, nsls: &[String]) -> Result<Stations> {
        let mut selected = Vec::with_capacity(nsls.len());
        for nsl in nsls {
            let station = self
                .iter()
                .find(|sta| sta.nsl() == *nsl)
                .ok_or_else(|| QSeekError::data(format!("could not find a station for {nsl}")))?;
            selected.push(station.clone());
        }
        Ok(Stations {
            stations: selected,
            resolved: true,
            ..Default::default()
        })
    }

    /// Centroid of all usable stations.
    pub fn centroid(&self) -> Location {
        let n = self.n_stations().max(1) as f64;
        let mut lat = 0.0;
        let mut lon = 0.0;
        let mut elevation = 0.0;
        for station in self.iter() {
            let (sta_lat, sta_lon) = station.coords.effective_lat_lon();
            lat += sta_lat;
            lon += sta_lon;
            elevation += station.coords.elevation;
        }
        Location {
            lat: lat / n,
            lon: lon / n,
            east_shift: 0.0,
            north_shift: 0.0,
            elevation: elevation / n,
            depth: 0.0,
        }
    }

    /// Dump the usable stations to a CSV file.
    pub fn export_csv(&self, filename: &Path) -> Result<()> {
        let mut file = fs::File::create(filename)
            .map_err(|e| QSeekError::io(format!("cannot create {}: {e}", filename.display())))?;
        writeln!(
            file,
            "network,station,location,latitude,longitude,elevation,depth"
        )?;
        for sta in self.iter() {
            let (lat, lon) = sta.coords.effective_lat_lon();
            writeln!(
                file,
                "{},{},{},{},{},{},{}",
                sta.network, sta.station, sta.location_code, lat, lon, sta.coords.elevation,
                sta.coords.depth
            )?;
        }
        Ok(())
    }
}
