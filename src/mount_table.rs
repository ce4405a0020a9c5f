//! Persisted mount tables: `fstab` and `crypttab`.
//!
//! Entries are keyed by UUID only; device paths like `/dev/sda2` renumber
//! across boots. Parsing keeps comments and unrecognised lines so that
//! replacing one entry rewrites the file without disturbing the rest.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::plan::mounts::under_root;

const FSTAB_HEADER: &str = "# Static information about the filesystems.\n\
                            # See fstab(5) for details.\n\
                            \n\
                            # <file system> <dir> <type> <options> <dump> <pass>\n";

const CRYPTTAB_HEADER: &str = "# Configuration for encrypted block devices.\n\
                               # See crypttab(5) for details.\n\
                               \n\
                               # <name> <device> <password> <options>\n";

pub fn fstab_path(root: &Path) -> PathBuf {
    under_root(root, Path::new("/etc/fstab"))
}

pub fn crypttab_path(root: &Path) -> PathBuf {
    under_root(root, Path::new("/etc/crypttab"))
}

/// Encode whitespace and backslashes the way fstab(5) expects.
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            other => out.push(other),
        }
    }
    out
}

/// Decode `\NNN` octal escapes; malformed sequences are kept verbatim.
pub fn unescape_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}

// ============================================================================
// fstab
// ============================================================================

/// One fstab entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FstabEntry {
    /// `UUID=...`, `LABEL=...` or a device path
    pub source: String,
    /// `none` for swap
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
    pub dump: u8,
    pub pass: u8,
}

impl FstabEntry {
    pub fn by_uuid(uuid: &str, mount_point: &str, fs_type: &str, options: &str, dump: u8, pass: u8) -> Self {
        Self {
            source: format!("UUID={}", uuid),
            mount_point: mount_point.to_string(),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
            dump,
            pass,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.source.strip_prefix("UUID=")
    }

    pub fn is_uuid_keyed(&self) -> bool {
        self.uuid().is_some_and(|u| !u.is_empty())
    }

    pub fn is_swap(&self) -> bool {
        self.fs_type == "swap"
    }

    /// `subvol=` option without the leading slash.
    pub fn subvolume(&self) -> Option<&str> {
        self.options
            .split(',')
            .find_map(|o| o.strip_prefix("subvol="))
            .map(|s| s.trim_start_matches('/'))
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.split(',').any(|o| o == name)
    }

    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return None;
        }
        Some(Self {
            source: unescape_field(fields[0]),
            mount_point: unescape_field(fields[1]),
            fs_type: fields[2].to_string(),
            options: fields[3].to_string(),
            dump: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
            pass: fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(0),
        })
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{} {}",
            escape_field(&self.source),
            escape_field(&self.mount_point),
            self.fs_type,
            self.options,
            self.dump,
            self.pass
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line<T> {
    Entry(T),
    /// Comments, blanks and lines that do not parse
    Other(String),
}

/// Parsed fstab, preserving non-entry lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountTable {
    lines: Vec<Line<FstabEntry>>,
}

impl MountTable {
    /// An empty table with the standard header.
    pub fn new() -> Self {
        Self::parse(FSTAB_HEADER)
    }

    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(raw.to_string());
                }
                match FstabEntry::parse(trimmed) {
                    Some(entry) => Line::Entry(entry),
                    None => Line::Other(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn entries(&self) -> impl Iterator<Item = &FstabEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Other(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines that look like entries but could not be parsed.
    pub fn malformed_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Other(raw) => {
                    let t = raw.trim();
                    (!t.is_empty() && !t.starts_with('#')).then_some(t)
                }
                Line::Entry(_) => None,
            })
            .collect()
    }

    pub fn find(&self, mount_point: &str) -> Option<&FstabEntry> {
        self.entries().find(|e| e.mount_point == mount_point)
    }

    pub fn push(&mut self, entry: FstabEntry) {
        self.lines.push(Line::Entry(entry));
    }

    pub fn push_comment(&mut self, comment: &str) {
        self.lines.push(Line::Other(format!("# {}", comment)));
    }

    /// Replace every entry for `entry.mount_point` with `entry`, or append it.
    ///
    /// Swap entries (`none`) are never collapsed.
    pub fn replace(&mut self, entry: FstabEntry) {
        let target = entry.mount_point.clone();
        let mut replaced = false;
        let mut kept = Vec::with_capacity(self.lines.len() + 1);
        for line in self.lines.drain(..) {
            match line {
                Line::Entry(e) if e.mount_point == target && target != "none" => {
                    if !replaced {
                        kept.push(Line::Entry(entry.clone()));
                        replaced = true;
                    }
                }
                other => kept.push(other),
            }
        }
        if !replaced {
            kept.push(Line::Entry(entry));
        }
        self.lines = kept;
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(e) => out.push_str(&e.to_string()),
                Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }
}

// ============================================================================
// crypttab
// ============================================================================

/// One crypttab entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrypttabEntry {
    pub name: String,
    /// `UUID=<luks uuid>`
    pub device: String,
    /// Key file or `none` to prompt at boot
    pub key: String,
    pub options: String,
}

impl CrypttabEntry {
    pub fn luks(name: &str, luks_uuid: &str) -> Self {
        Self {
            name: name.to_string(),
            device: format!("UUID={}", luks_uuid),
            key: "none".to_string(),
            options: "luks".to_string(),
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.device.strip_prefix("UUID=")
    }

    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            device: unescape_field(fields[1]),
            key: fields.get(2).unwrap_or(&"none").to_string(),
            options: fields.get(3).unwrap_or(&"").to_string(),
        })
    }
}

impl fmt::Display for CrypttabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.name,
            escape_field(&self.device),
            self.key,
            self.options
        )
    }
}

/// Parsed crypttab, preserving non-entry lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Crypttab {
    lines: Vec<Line<CrypttabEntry>>,
}

impl Crypttab {
    pub fn new() -> Self {
        Self::parse(CRYPTTAB_HEADER)
    }

    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(raw.to_string());
                }
                match CrypttabEntry::parse(trimmed) {
                    Some(entry) => Line::Entry(entry),
                    None => Line::Other(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn entries(&self) -> impl Iterator<Item = &CrypttabEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Other(_) => None,
        })
    }

    pub fn find(&self, name: &str) -> Option<&CrypttabEntry> {
        self.entries().find(|e| e.name == name)
    }

    /// Replace the entry with the same mapping name, or append.
    pub fn replace(&mut self, entry: CrypttabEntry) {
        for line in &mut self.lines {
            if let Line::Entry(existing) = line {
                if existing.name == entry.name {
                    *existing = entry;
                    return;
                }
            }
        }
        self.lines.push(Line::Entry(entry));
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(e) => out.push_str(&e.to_string()),
                Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# /dev/nvme0n1p2 LABEL=ROOT
UUID=aaaa-1111\t/\tbtrfs\trw,noatime,compress=zstd:3\t0 0

UUID=bbbb-2222\t/home\tbtrfs\trw,subvol=/@home\t0 0
/dev/sdc1 none swap defaults 0 0
broken-line
";

    #[test]
    fn test_parse_keeps_comments_and_entries() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.len(), 3);
        assert_eq!(table.malformed_lines(), vec!["broken-line"]);

        let home = table.find("/home").expect("/home entry");
        assert_eq!(home.uuid(), Some("bbbb-2222"));
        assert_eq!(home.subvolume(), Some("@home"));

        let swap = table.entries().find(|e| e.is_swap()).expect("swap entry");
        assert!(!swap.is_uuid_keyed());
    }

    #[test]
    fn test_render_round_trips_unchanged() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.render(), SAMPLE.replace("/dev/sdc1 none swap defaults 0 0", "/dev/sdc1\tnone\tswap\tdefaults\t0 0"));
    }

    #[test]
    fn test_replace_home_entry() {
        let mut table = MountTable::parse(SAMPLE);
        table.replace(FstabEntry::by_uuid(
            "cccc-3333",
            "/home",
            "btrfs",
            "subvol=/@home,noatime",
            0,
            0,
        ));
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.find("/home").and_then(|e| e.uuid()),
            Some("cccc-3333")
        );
        // Comment survives
        assert!(table.render().starts_with("# /dev/nvme0n1p2 LABEL=ROOT\n"));
    }

    #[test]
    fn test_replace_appends_new_mount_point() {
        let mut table = MountTable::new();
        table.replace(FstabEntry::by_uuid("u1", "/cache", "btrfs", "defaults", 0, 0));
        assert_eq!(table.len(), 1);
        assert!(table.render().contains("UUID=u1\t/cache\tbtrfs\tdefaults\t0 0"));
    }

    #[test]
    fn test_escape_round_trip_spaces() {
        let entry = FstabEntry::by_uuid("u1", "/media/My Disk", "vfat", "defaults", 0, 2);
        let rendered = entry.to_string();
        assert!(rendered.contains("/media/My\\040Disk"));
        let table = MountTable::parse(&rendered);
        assert_eq!(
            table.entries().next().map(|e| e.mount_point.as_str()),
            Some("/media/My Disk")
        );
    }

    #[test]
    fn test_crypttab_replace_and_render() {
        let mut tab = Crypttab::new();
        tab.replace(CrypttabEntry::luks("crypthome", "dddd-4444"));
        tab.replace(CrypttabEntry::luks("crypthome", "eeee-5555"));
        assert_eq!(tab.entries().count(), 1);
        let reparsed = Crypttab::parse(&tab.render());
        assert_eq!(
            reparsed.find("crypthome").and_then(|e| e.uuid()),
            Some("eeee-5555")
        );
    }

    #[test]
    fn test_unescape_keeps_invalid_sequences() {
        assert_eq!(unescape_field("a\\9b"), "a\\9b");
        assert_eq!(unescape_field("tab\\011here"), "tab\there");
    }

    #[test]
    fn test_paths_under_root() {
        assert_eq!(fstab_path(Path::new("/mnt")), PathBuf::from("/mnt/etc/fstab"));
        assert_eq!(fstab_path(Path::new("/")), PathBuf::from("/etc/fstab"));
    }
}
