// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - LIST output parsing
//
// Understands the two layouts servers actually send: Unix `ls -l` and the
// DOS style IIS uses. Lines in neither layout ("total 12", banners) are
// skipped.

use super::{EntryKind, RemoteEntry};
use regex::Regex;
use std::sync::OnceLock;

fn unix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^([dlcbps-])[rwxsStT-]{9}[+@.]?\s+  # type and permissions
            \d+\s+                             # link count
            \S+\s+                             # owner
            (?:\S+\s+)?                        # group, left out by some servers
            (\d+)\s+                           # size
            (\w{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+
            (.+)$                              # name, maybe with -> target
            ",
        )
        .unwrap_or_else(|e| panic!("invalid LIST pattern: {}", e))
    })
}

fn dos_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(\d{2}-\d{2}-\d{2,4}\s+\d{1,2}:\d{2}\s*(?:AM|PM)?)\s+
            (<DIR>|\d+)\s+
            (.+)$
            ",
        )
        .unwrap_or_else(|e| panic!("invalid LIST pattern: {}", e))
    })
}

/// Parse the body of a LIST reply
pub fn parse_listing(raw: &str) -> Vec<RemoteEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .filter_map(|line| parse_unix(line).or_else(|| parse_dos(line)))
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

fn parse_unix(line: &str) -> Option<RemoteEntry> {
    let caps = unix_regex().captures(line)?;

    let kind = match &caps[1] {
        "d" => EntryKind::Directory,
        "l" => EntryKind::Link,
        "-" => EntryKind::File,
        _ => EntryKind::Other,
    };
    let name = match (kind, caps[4].split_once(" -> ")) {
        (EntryKind::Link, Some((name, _target))) => name,
        _ => &caps[4],
    };

    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size: caps[2].parse().unwrap_or(0),
        modified: Some(caps[3].split_whitespace().collect::<Vec<_>>().join(" ")),
    })
}

fn parse_dos(line: &str) -> Option<RemoteEntry> {
    let caps = dos_regex().captures(line)?;

    let (kind, size) = match &caps[2] {
        "<DIR>" => (EntryKind::Directory, 0),
        size => (EntryKind::File, size.parse().unwrap_or(0)),
    };

    Some(RemoteEntry {
        name: caps[3].to_string(),
        kind,
        size,
        modified: Some(caps[1].split_whitespace().collect::<Vec<_>>().join(" ")),
    })
}
