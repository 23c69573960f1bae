use std::fmt;

use mac_address::MacAddress;

/// A connectable handle to a UWB beacon, as resolved by the manager backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Beacon {
    /// Backend specific identifier (peripheral id for BLE, address for the simulator).
    pub id: String,
    pub address: Option<MacAddress>,
    pub name: Option<String>,
}

impl Beacon {
    pub fn new(id: impl Into<String>) -> Self {
        Beacon {
            id: id.into(),
            address: None,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: MacAddress) -> Self {
        self.address = Some(address);
        self
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// One entry of a scan result. The handle can be missing when the
/// advertisement was seen but the device is not (yet) connectable.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredBeacon {
    pub device: Option<Beacon>,
    pub rssi: Option<i16>,
}

impl From<Beacon> for DiscoveredBeacon {
    fn from(beacon: Beacon) -> Self {
        DiscoveredBeacon {
            device: Some(beacon),
            rssi: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScanEvent {
    DeviceList(Vec<DiscoveredBeacon>),
    Error(/* error code */ i32),
    ScanNotStarted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RangingPosition {
    pub beacon: Beacon,
    /// Meters.
    pub distance: Option<f64>,
    /// Degrees.
    pub azimuth: Option<f64>,
    /// Degrees.
    pub elevation: Option<f64>,
}

impl RangingPosition {
    pub fn distance_only(beacon: Beacon, distance: Option<f64>) -> Self {
        RangingPosition {
            beacon,
            distance,
            azimuth: None,
            elevation: None,
        }
    }

    /// Distance as it is written to the log, `null` when the measurement is absent.
    pub fn distance_string(&self) -> String {
        match self.distance {
            Some(distance) => distance.to_string(),
            None => "null".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RangingEvent {
    Position(RangingPosition),
    Error(/* message */ String),
    Other,
}
