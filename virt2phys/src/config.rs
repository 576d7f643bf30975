use std::env;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{self, SysconfVar};
use simplelog::LevelFilter;

use crate::error::{Error, Result};
use crate::record::PageCacheFilter;

pub const PROC_ROOT_VAR: &str = "VIRT2PHYS_PROC_ROOT";
pub const PAGECACHE_FILTER_VAR: &str = "VIRT2PHYS_PAGECACHE_FILTER";
pub const LOG_LEVEL_VAR: &str = "VIRT2PHYS_LOG";

const DEFAULT_PROC_ROOT: &str = "/proc";

/// Platform facts and knobs, computed once at startup and handed to every
/// range source and scanner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub page_size: u64,
    /// Number of physical page frames on the machine.
    pub page_count: u64,
    pub proc_root: PathBuf,
    pub pagecache_filter: PageCacheFilter,
}

impl Config {
    pub fn new(page_size: u64, page_count: u64) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "page size {} is not a power of two",
                page_size
            )));
        }
        Ok(Config {
            page_size,
            page_count,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            pagecache_filter: PageCacheFilter::default(),
        })
    }

    /// Query the running system, then apply environment overrides.
    pub fn detect() -> Result<Self> {
        let page_size = sysconf(SysconfVar::PAGE_SIZE, "sysconf(_SC_PAGESIZE)")?;
        let page_count = sysconf(SysconfVar::_PHYS_PAGES, "sysconf(_SC_PHYS_PAGES)")?;
        let mut config = Config::new(page_size, page_count)?;
        if let Some(root) = env::var_os(PROC_ROOT_VAR) {
            config.proc_root = PathBuf::from(root);
        }
        if let Ok(filter) = env::var(PAGECACHE_FILTER_VAR) {
            config.pagecache_filter = filter.parse()?;
        }
        debug!(
            "page size {:#x}, {} physical pages, proc root {}, page cache filter {}",
            config.page_size,
            config.page_count,
            config.proc_root.display(),
            config.pagecache_filter
        );
        Ok(config)
    }

    pub fn with_proc_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn with_pagecache_filter(mut self, filter: PageCacheFilter) -> Self {
        self.pagecache_filter = filter;
        self
    }

    pub fn proc_path<P: AsRef<Path>>(&self, rel: P) -> PathBuf {
        self.proc_root.join(rel)
    }

    pub fn round_down(&self, addr: u64) -> u64 {
        addr & !(self.page_size - 1)
    }

    /// Round up to the next page boundary, clamping at the last whole page
    /// of the address space.
    pub fn round_up(&self, addr: u64) -> u64 {
        match addr.checked_add(self.page_size - 1) {
            Some(a) => self.round_down(a),
            None => self.round_down(u64::MAX),
        }
    }

    pub fn physical_end(&self) -> u64 {
        self.page_count.saturating_mul(self.page_size)
    }
}

fn sysconf(var: SysconfVar, what: &str) -> Result<u64> {
    match unistd::sysconf(var) {
        Ok(Some(n)) if n > 0 => Ok(n as u64),
        Ok(_) => Err(Error::resource(
            what,
            io::Error::new(io::ErrorKind::Unsupported, "no value for this system"),
        )),
        Err(errno) => Err(Error::resource(what, io::Error::from(errno))),
    }
}

/// Log level from the environment, `Warn` when unset.
pub fn log_level() -> Result<LevelFilter> {
    match env::var(LOG_LEVEL_VAR) {
        Ok(level) => level
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("{}: bad log level '{}'", LOG_LEVEL_VAR, level))),
        Err(_) => Ok(LevelFilter::Warn),
    }
}
