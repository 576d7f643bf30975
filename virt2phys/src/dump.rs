use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::Path;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::ranges::{full_physical_range, kernel_regions, process_maps};
use crate::record::{decode_pageflags, decode_translation, KPageFlags, PageCacheFilter, PagemapEntry};
use crate::statistics::ScanStatistics;
use crate::table::{Fetch, PositionalRead, RecordTable};
use crate::{Config, Interval, ScanMode};

/// How a mode turns raw records into output: which decoder, which pages to
/// keep, and what goes on the `p` line.
pub trait PagePolicy {
    type Record;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Record>;

    fn keep(&self, record: &Self::Record) -> bool;

    fn write_page<W: Write>(&self, out: &mut W, addr: u64, record: &Self::Record) -> io::Result<()>;
}

/// Process mode: resident virtual pages and the frame behind each.
pub struct ResidentPages {
    page_size: u64,
}

impl ResidentPages {
    pub fn new(config: &Config) -> Self {
        ResidentPages {
            page_size: config.page_size,
        }
    }
}

impl PagePolicy for ResidentPages {
    type Record = PagemapEntry;

    fn decode(&self, bytes: &[u8]) -> Result<PagemapEntry> {
        decode_translation(bytes)
    }

    fn keep(&self, entry: &PagemapEntry) -> bool {
        entry.present
    }

    fn write_page<W: Write>(&self, out: &mut W, addr: u64, entry: &PagemapEntry) -> io::Result<()> {
        writeln!(
            out,
            "p {:#018x} {:#018x} {} {}",
            addr,
            entry.physical_address(self.page_size),
            entry.exclusive as u8,
            entry.file_shared as u8
        )
    }
}

fn write_flags<W: Write>(out: &mut W, addr: u64, flags: &KPageFlags) -> io::Result<()> {
    trace!("{:#x}: {:?}", addr, flags.names());
    writeln!(out, "p {:#018x} {:#018x}", addr, flags.raw())
}

/// Kernel mode: every physical page in range, flags passed through raw.
pub struct AllPages;

impl PagePolicy for AllPages {
    type Record = KPageFlags;

    fn decode(&self, bytes: &[u8]) -> Result<KPageFlags> {
        decode_pageflags(bytes)
    }

    fn keep(&self, _flags: &KPageFlags) -> bool {
        true
    }

    fn write_page<W: Write>(&self, out: &mut W, addr: u64, flags: &KPageFlags) -> io::Result<()> {
        write_flags(out, addr, flags)
    }
}

/// Page cache mode: physical pages the filter considers file cache.
pub struct PageCachePages {
    filter: PageCacheFilter,
}

impl PageCachePages {
    pub fn new(filter: PageCacheFilter) -> Self {
        PageCachePages { filter }
    }
}

impl PagePolicy for PageCachePages {
    type Record = KPageFlags;

    fn decode(&self, bytes: &[u8]) -> Result<KPageFlags> {
        decode_pageflags(bytes)
    }

    fn keep(&self, flags: &KPageFlags) -> bool {
        self.filter.matches(flags)
    }

    fn write_page<W: Write>(&self, out: &mut W, addr: u64, flags: &KPageFlags) -> io::Result<()> {
        write_flags(out, addr, flags)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// The table ran out before the interval did.
    EndOfTable,
    /// A read failed; the rest of the interval was skipped.
    Aborted,
}

pub struct Scanner<'a> {
    config: &'a Config,
    stats: ScanStatistics,
}

impl<'a> Scanner<'a> {
    pub fn new(config: &'a Config) -> Self {
        Scanner {
            config,
            stats: ScanStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &ScanStatistics {
        &self.stats
    }

    pub fn into_statistics(self) -> ScanStatistics {
        self.stats
    }

    /// Walk one interval a page at a time. Read failures end the interval,
    /// not the run; only output errors are returned.
    pub fn scan<R, P, W>(
        &mut self,
        interval: &Interval,
        table: &RecordTable<R>,
        policy: &P,
        out: &mut W,
    ) -> Result<ScanOutcome>
    where
        R: PositionalRead,
        P: PagePolicy,
        W: Write,
    {
        let start_time = Utc::now();
        let page_size = self.config.page_size;
        let mut addr = interval.start;
        let outcome = loop {
            if addr >= interval.end {
                break ScanOutcome::Completed;
            }
            match table.fetch(addr / page_size) {
                Ok(Fetch::Record(bytes)) => {
                    self.stats.pages_read += 1;
                    let record = policy.decode(&bytes)?;
                    if policy.keep(&record) {
                        policy.write_page(out, addr, &record)?;
                        self.stats.pages_emitted += 1;
                    }
                }
                Ok(Fetch::Short(n)) => {
                    debug!(
                        "{} ends at {:#x} ({} byte read)",
                        table.path().display(),
                        addr,
                        n
                    );
                    break ScanOutcome::EndOfTable;
                }
                Err(e) => {
                    error!("Can't read from {}: {}", table.path().display(), e);
                    break ScanOutcome::Aborted;
                }
            }
            addr = match addr.checked_add(page_size) {
                Some(next) => next,
                None => break ScanOutcome::Completed,
            };
        };
        debug!(
            "Scanned {:#x}-{:#x} ({:#x} bytes) {} in {} ms: {:?}",
            interval.start,
            interval.end,
            interval.len(),
            interval.label,
            (Utc::now() - start_time).num_milliseconds(),
            outcome
        );
        self.stats.record_interval(outcome);
        Ok(outcome)
    }

    /// Announce and scan each interval in the order the source yields them.
    pub fn scan_all<I, R, P, W>(
        &mut self,
        intervals: I,
        table: &RecordTable<R>,
        policy: &P,
        out: &mut W,
    ) -> Result<()>
    where
        I: Iterator<Item = Result<Interval>>,
        R: PositionalRead,
        P: PagePolicy,
        W: Write,
    {
        for interval in intervals {
            let interval = interval?;
            writeln!(
                out,
                "v {:#018x} {:#018x} {}",
                interval.start, interval.end, interval.label
            )?;
            self.scan(&interval, table, policy, out)?;
        }
        Ok(())
    }
}

fn open_listing(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::resource(path.display().to_string(), e))
}

fn write_header<W: Write>(out: &mut W, id: i64, label: &str) -> Result<()> {
    writeln!(out, "= {} {}", id, label)?;
    Ok(())
}

/// Scan everything `mode` selects and write the record stream to `out`.
///
/// All listings and tables are opened before the first line is written, so a
/// missing process or a permission problem produces no output at all.
pub fn run<W: Write>(mode: &ScanMode, config: &Config, out: &mut W) -> Result<ScanStatistics> {
    let start_time = Utc::now();
    let mut scanner = Scanner::new(config);
    match *mode {
        ScanMode::Process(pid) => {
            let maps = open_listing(&config.proc_path(format!("{}/maps", pid)))?;
            let pagemap = RecordTable::open(config.proc_path(format!("{}/pagemap", pid)))?;
            let executable = fs::read_link(config.proc_path(format!("{}/exe", pid)))
                .map(|exe| exe.display().to_string())
                .unwrap_or_default();
            write_header(out, mode.id(), &executable)?;
            scanner.scan_all(process_maps(maps, config), &pagemap, &ResidentPages::new(config), out)?;
        }
        ScanMode::Kernel => {
            let iomem = open_listing(&config.proc_path("iomem"))?;
            let kpageflags = RecordTable::open(config.proc_path("kpageflags"))?;
            write_header(out, mode.id(), "kernel")?;
            scanner.scan_all(kernel_regions(iomem, config), &kpageflags, &AllPages, out)?;
        }
        ScanMode::PageCache => {
            let kpageflags = RecordTable::open(config.proc_path("kpageflags"))?;
            write_header(out, mode.id(), "pagecache")?;
            let policy = PageCachePages::new(config.pagecache_filter);
            scanner.scan_all(full_physical_range(config), &kpageflags, &policy, out)?;
        }
    }
    out.flush()?;
    debug!(
        "Finished {} in {} ms",
        mode,
        (Utc::now() - start_time).num_milliseconds()
    );
    Ok(scanner.into_statistics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;

    const PAGE: u64 = 0x1000;
    const PRESENT: u64 = 1 << 63;

    fn config() -> Config {
        Config::new(PAGE, 8).unwrap()
    }

    fn table_of(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect()
    }

    struct Recording {
        bytes: Vec<u8>,
        offsets: RefCell<Vec<u64>>,
    }

    impl PositionalRead for Recording {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            self.offsets.borrow_mut().push(offset);
            self.bytes.read_at(buf, offset)
        }
    }

    /// Serves records up to `fail_at`, then returns EIO.
    struct FailingAfter {
        bytes: Vec<u8>,
        fail_at: u64,
    }

    impl PositionalRead for FailingAfter {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            if offset >= self.fail_at {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            self.bytes.read_at(buf, offset)
        }
    }

    fn output(out: Vec<u8>) -> Vec<String> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn one_read_per_page_at_record_offsets() {
        let config = config();
        let table = RecordTable::new(
            Recording {
                bytes: table_of(&[0; 8]),
                offsets: RefCell::new(Vec::new()),
            },
            "recording",
        );
        let mut scanner = Scanner::new(&config);
        let mut out = Vec::new();
        let outcome = scanner
            .scan(&Interval::new(0, 3 * PAGE, ""), &table, &ResidentPages::new(&config), &mut out)
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Completed);
        assert_eq!(*table.source().offsets.borrow(), vec![0, 8, 16]);
    }

    #[test]
    fn partial_last_page_is_still_read() {
        let config = config();
        let table = RecordTable::new(
            Recording {
                bytes: table_of(&[0; 8]),
                offsets: RefCell::new(Vec::new()),
            },
            "recording",
        );
        let mut scanner = Scanner::new(&config);
        scanner
            .scan(&Interval::new(PAGE, PAGE * 3 + 0x800, ""), &table, &AllPages, &mut Vec::new())
            .unwrap();
        assert_eq!(*table.source().offsets.borrow(), vec![8, 16, 24]);
    }

    #[test]
    fn absent_pages_are_never_emitted() {
        let config = config();
        let words = [
            0,
            (1 << 62) | 7,
            (1 << 61) | (1 << 56) | 0x55,
            u64::MAX & !PRESENT,
            PRESENT | 3,
        ];
        let table = RecordTable::new(table_of(&words), "pagemap");
        let mut scanner = Scanner::new(&config);
        let mut out = Vec::new();
        scanner
            .scan(&Interval::new(0, 5 * PAGE, ""), &table, &ResidentPages::new(&config), &mut out)
            .unwrap();
        assert_eq!(
            output(out),
            vec!["p 0x0000000000004000 0x0000000000003000 0 0"]
        );
        assert_eq!(scanner.statistics().pages_read, 5);
        assert_eq!(scanner.statistics().pages_emitted, 1);
    }

    proptest! {
        #[test]
        fn absent_words_never_reach_the_output(words in proptest::collection::vec(any::<u64>(), 1..64)) {
            let config = config();
            let absent: Vec<u64> = words.iter().map(|w| w & !PRESENT).collect();
            let table = RecordTable::new(table_of(&absent), "pagemap");
            let mut scanner = Scanner::new(&config);
            let mut out = Vec::new();
            let end = absent.len() as u64 * PAGE;
            scanner
                .scan(&Interval::new(0, end, ""), &table, &ResidentPages::new(&config), &mut out)
                .unwrap();
            prop_assert!(out.is_empty());
            prop_assert_eq!(scanner.statistics().pages_read, absent.len() as u64);
        }

        #[test]
        fn one_line_per_present_word(words in proptest::collection::vec(any::<u64>(), 1..64)) {
            let config = config();
            let table = RecordTable::new(table_of(&words), "pagemap");
            let mut out = Vec::new();
            let end = words.len() as u64 * PAGE;
            Scanner::new(&config)
                .scan(&Interval::new(0, end, ""), &table, &ResidentPages::new(&config), &mut out)
                .unwrap();
            let present = words.iter().filter(|w| *w & PRESENT != 0).count();
            prop_assert_eq!(output(out).len(), present);
        }
    }

    #[test]
    fn resident_line_carries_exclusive_and_shared() {
        let config = config();
        let table = RecordTable::new(table_of(&[PRESENT | (1 << 56) | (1 << 61) | 2]), "pagemap");
        let mut out = Vec::new();
        Scanner::new(&config)
            .scan(&Interval::new(0, PAGE, ""), &table, &ResidentPages::new(&config), &mut out)
            .unwrap();
        assert_eq!(
            output(out),
            vec!["p 0x0000000000000000 0x0000000000002000 1 1"]
        );
    }

    #[test]
    fn kernel_pages_all_emitted_with_raw_flags() {
        let config = config();
        let table = RecordTable::new(table_of(&[0, 0x20, 1 << 40]), "kpageflags");
        let mut out = Vec::new();
        Scanner::new(&config)
            .scan(&Interval::new(0, 3 * PAGE, ""), &table, &AllPages, &mut out)
            .unwrap();
        assert_eq!(
            output(out),
            vec![
                "p 0x0000000000000000 0x0000000000000000",
                "p 0x0000000000001000 0x0000000000000020",
                "p 0x0000000000002000 0x0000010000000000",
            ]
        );
    }

    #[test]
    fn page_cache_skips_anonymous_pages() {
        let config = config();
        let mapped = KPageFlags::MAPPEDTODISK.bits();
        let anon = (KPageFlags::MAPPEDTODISK | KPageFlags::ANON).bits();
        let table = RecordTable::new(table_of(&[anon, mapped, 0, anon | mapped]), "kpageflags");
        let mut out = Vec::new();
        Scanner::new(&config)
            .scan(
                &Interval::new(0, 4 * PAGE, ""),
                &table,
                &PageCachePages::new(PageCacheFilter::MappedNotAnon),
                &mut out,
            )
            .unwrap();
        assert_eq!(
            output(out),
            vec!["p 0x0000000000001000 0x0000000400000000"]
        );
    }

    #[test]
    fn end_of_table_stops_quietly() {
        let config = config();
        let table = RecordTable::new(table_of(&[PRESENT, PRESENT]), "pagemap");
        let mut scanner = Scanner::new(&config);
        let mut out = Vec::new();
        let outcome = scanner
            .scan(&Interval::new(0, 6 * PAGE, ""), &table, &ResidentPages::new(&config), &mut out)
            .unwrap();
        assert_eq!(outcome, ScanOutcome::EndOfTable);
        assert_eq!(output(out).len(), 2);
        assert_eq!(scanner.statistics().truncated_intervals, 1);
    }

    #[test]
    fn read_error_abandons_only_that_interval() {
        let config = config();
        let table = RecordTable::new(
            FailingAfter {
                bytes: table_of(&[PRESENT | 1, PRESENT | 2, PRESENT | 3, PRESENT | 4]),
                fail_at: 16,
            },
            "pagemap",
        );
        let intervals = vec![
            Ok(Interval::new(0, 4 * PAGE, "a")),
            Ok(Interval::new(0, PAGE, "b")),
        ];
        let mut scanner = Scanner::new(&config);
        let mut out = Vec::new();
        scanner
            .scan_all(intervals.into_iter(), &table, &ResidentPages::new(&config), &mut out)
            .unwrap();
        assert_eq!(
            output(out),
            vec![
                "v 0x0000000000000000 0x0000000000004000 a",
                "p 0x0000000000000000 0x0000000000001000 0 0",
                "p 0x0000000000001000 0x0000000000002000 0 0",
                "v 0x0000000000000000 0x0000000000001000 b",
                "p 0x0000000000000000 0x0000000000001000 0 0",
            ]
        );
        let stats = scanner.into_statistics();
        assert_eq!(stats.intervals, 2);
        assert_eq!(stats.aborted_intervals, 1);
    }

    #[test]
    fn listing_errors_are_fatal() {
        let config = config();
        let table = RecordTable::new(table_of(&[PRESENT]), "pagemap");
        let intervals = vec![
            Ok(Interval::new(0, PAGE, "a")),
            Err(Error::resource("maps listing", io::Error::from_raw_os_error(libc::EIO))),
        ];
        let mut out = Vec::new();
        let result = Scanner::new(&config).scan_all(
            intervals.into_iter(),
            &table,
            &ResidentPages::new(&config),
            &mut out,
        );
        assert!(matches!(result, Err(Error::ResourceUnavailable { .. })));
    }

    struct Zeros;

    impl PositionalRead for Zeros {
        fn read_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            for b in buf.iter_mut() {
                *b = 0;
            }
            Ok(buf.len())
        }
    }

    #[test]
    fn top_of_address_space_terminates() {
        let config = config();
        let table = RecordTable::new(Zeros, "zeros");
        let interval = Interval::new(u64::MAX - PAGE + 1, u64::MAX, "");
        let mut scanner = Scanner::new(&config);
        let outcome = scanner
            .scan(&interval, &table, &AllPages, &mut Vec::new())
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Completed);
        assert_eq!(scanner.statistics().pages_read, 1);
    }
}
