#[macro_use]
extern crate scan_fmt;

extern crate byteorder;
extern crate chrono;

#[macro_use]
extern crate log;

pub mod config;
pub mod dump;
pub mod error;
pub mod ranges;
pub mod record;
pub mod statistics;
pub mod table;

use std::fmt;
use std::str::FromStr;

pub use config::Config;
pub use dump::run;
pub use error::{Error, Result};

/// Both pagemap and kpageflags entries are one 64-bit word per page.
pub const RECORD_SIZE: usize = 8;

/// A page-aligned address range to scan, with the mapping or region name it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
    pub label: String,
}

impl Interval {
    pub fn new<S: Into<String>>(start: u64, end: u64, label: S) -> Self {
        Interval {
            start,
            end: end.max(start),
            label: label.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What to scan. Picked once from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Virtual pages of one process, through its pagemap.
    Process(u32),
    /// Physical pages of the kernel image regions, through kpageflags.
    Kernel,
    /// Every physical page that looks like file cache, through kpageflags.
    PageCache,
}

impl ScanMode {
    /// The id written on the `=` header line.
    pub fn id(&self) -> i64 {
        match self {
            ScanMode::Process(pid) => i64::from(*pid),
            ScanMode::Kernel => 0,
            ScanMode::PageCache => -1,
        }
    }
}

impl FromStr for ScanMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kernel" => Ok(ScanMode::Kernel),
            "pagecache" => Ok(ScanMode::PageCache),
            pid => pid.parse::<u32>().map(ScanMode::Process).map_err(|_| {
                Error::InvalidArgument(format!(
                    "First argument must be a pid, 'kernel' or 'pagecache', not '{}'",
                    pid
                ))
            }),
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScanMode::Process(pid) => write!(f, "process {}", pid),
            ScanMode::Kernel => f.write_str("kernel"),
            ScanMode::PageCache => f.write_str("pagecache"),
        }
    }
}
