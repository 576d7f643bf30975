// Sources of address intervals to scan: a process's maps, the kernel
// regions in iomem, or all of physical memory.
//
// Intervals come out in listing order. Nothing is sorted, merged or
// deduplicated; overlapping entries are scanned twice.

use std::io::BufRead;
use std::iter;

use crate::error::{Error, Result};
use crate::{Config, Interval};

/// iomem sub-regions whose name starts with this hold the kernel image.
pub const KERNEL_REGION_PREFIX: &str = "Kernel";

pub const PHYSICAL_LABEL: &str = "physical";

/// One interval per `/proc/<pid>/maps` line.
///
/// The label is everything after the inode field, not just the text after the
/// last space as the C tool did, so `/tmp/x (deleted)` stays whole.
pub fn process_maps<'a, R: BufRead + 'a>(
    maps: R,
    config: &'a Config,
) -> impl Iterator<Item = Result<Interval>> + 'a {
    maps.lines().filter_map(move |line| match line {
        Err(e) => Some(Err(Error::resource("maps listing", e))),
        Ok(line) => {
            let interval = parse_maps_line(&line, config);
            if interval.is_none() {
                error!("Unable to parse maps line: {}", line);
            }
            interval.map(Ok)
        }
    })
}

// 55d5c8a2e000-55d5c8a30000 r--p 00000000 fd:01 1048602                    /usr/bin/cat
fn parse_maps_line(line: &str, config: &Config) -> Option<Interval> {
    let (start, end) = scan_fmt!(line, "{x}-{x}", [hex u64], [hex u64]).ok()?;
    // Address, perms, offset, dev and inode come first; whatever follows the
    // padding is the pathname. Anonymous mappings have none.
    let pathname = line.splitn(6, ' ').nth(5).map(str::trim_start).unwrap_or("");
    Some(Interval::new(
        config.round_down(start),
        config.round_up(end),
        pathname,
    ))
}

/// One interval per indented `/proc/iomem` line naming a kernel image region.
pub fn kernel_regions<'a, R: BufRead + 'a>(
    iomem: R,
    config: &'a Config,
) -> impl Iterator<Item = Result<Interval>> + 'a {
    iomem.lines().filter_map(move |line| match line {
        Err(e) => Some(Err(Error::resource("iomem listing", e))),
        Ok(line) => parse_kernel_region(&line, config).map(Ok),
    })
}

//   01000000-01e00e16 : Kernel code
fn parse_kernel_region(line: &str, config: &Config) -> Option<Interval> {
    if !line.starts_with(char::is_whitespace) {
        return None;
    }
    let line = line.trim_start();
    let label = line.split_once(" : ")?.1.trim_end();
    if !label.starts_with(KERNEL_REGION_PREFIX) {
        return None;
    }
    let (start, last) = match scan_fmt!(line, "{x}-{x}", [hex u64], [hex u64]) {
        Ok(range) => range,
        Err(_) => {
            error!("Unable to parse iomem line: {}", line);
            return None;
        }
    };
    // iomem ends are inclusive
    Some(Interval::new(
        config.round_down(start),
        config.round_up(last.saturating_add(1)),
        label,
    ))
}

/// A single interval covering every physical frame.
pub fn full_physical_range(config: &Config) -> impl Iterator<Item = Result<Interval>> {
    iter::once(Ok(Interval::new(0, config.physical_end(), PHYSICAL_LABEL)))
}
