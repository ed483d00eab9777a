//! Parser for the card's HTML directory listing.
//!
//! The card renders a directory as a single `<pre>` block, one entry per
//! line, fixed-width columns with the leading zeros dropped:
//!
//! ```text
//!    2023- 1-15   13: 5:22         <DIR>   <a href="dir?dir=A:%5CDATALOG"> DATALOG</a>
//!    2023- 1-15   13: 5:40          4KB    <a href="download?file=STR.EDF"> STR.EDF</a>
//! ```
//!
//! Links whose path ends in `dir` are subdirectories, links ending in
//! `download` are files. Anything else on the page is ignored.

use chrono::{Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};

use crate::error::{Result, SyncError};

use super::types::{Listing, ListingRules, RemoteDir, RemoteFile};

/// Parse one listing page. `url` is only used for error messages.
pub fn parse_listing(html: &str, url: &str, rules: &ListingRules) -> Result<Listing> {
    let block = pre_block(html).ok_or_else(|| SyncError::Parse {
        url: url.to_string(),
        reason: "no <pre> block in listing".into(),
    })?;

    let mut listing = Listing::default();

    for line in block.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let Some(anchor) = find_anchor(line) else {
            tracing::trace!(line, "listing line without link");
            continue;
        };

        let Some(name) = rules.admit(&anchor.text) else {
            tracing::debug!(name = %anchor.text, "ignored");
            continue;
        };

        let (path, query) = split_href(&anchor.href);
        if path.ends_with("download") {
            listing.files.push(RemoteFile {
                name,
                query: query.to_string(),
                modified: line_timestamp(line),
            });
        } else if path.ends_with("dir") {
            listing.dirs.push(RemoteDir {
                name,
                href: anchor.href,
            });
        } else {
            tracing::trace!(href = %anchor.href, "link is neither file nor directory");
        }
    }

    Ok(listing)
}

/// Contents of the first `<pre>` element. An unterminated block runs to
/// the end of the document.
fn pre_block(html: &str) -> Option<&str> {
    let lower = html.to_ascii_lowercase();
    let mut from = 0;

    while let Some(pos) = lower[from..].find("<pre") {
        let tag = from + pos;
        let after = lower.as_bytes().get(tag + 4).copied();
        if matches!(after, Some(b'>') | Some(b' ' | b'\t' | b'\r' | b'\n')) {
            let open_end = tag + lower[tag..].find('>')? + 1;
            let close = lower[open_end..]
                .find("</pre")
                .map_or(html.len(), |p| open_end + p);
            return Some(&html[open_end..close]);
        }
        from = tag + 4;
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
struct Anchor {
    href: String,
    text: String,
}

fn find_anchor(line: &str) -> Option<Anchor> {
    let lower = line.to_ascii_lowercase();
    let mut from = 0;

    loop {
        let tag = from + lower[from..].find("<a")?;
        let after = lower.as_bytes().get(tag + 2).copied();
        if !matches!(after, Some(b' ' | b'\t' | b'>')) {
            from = tag + 2;
            continue;
        }

        let attrs_start = tag + 2;
        let open_end = attrs_start + tag_end(&line[attrs_start..])?;
        let attrs = &line[attrs_start..open_end];
        let text_start = open_end + 1;
        let text_end = lower[text_start..]
            .find("</a")
            .map_or(line.len(), |p| text_start + p);

        let href = attribute(attrs, "href")?;
        let text = decode_entities(&strip_tags(&line[text_start..text_end]));

        return Some(Anchor {
            href: decode_entities(&href),
            text: text.trim().to_string(),
        });
    }
}

/// Offset of the `>` closing a start tag, skipping quoted attribute values.
fn tag_end(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn attribute(attrs: &str, wanted: &str) -> Option<String> {
    let mut rest = attrs;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }

        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '=' || c == '>')
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        rest = rest[name_len..].trim_start();

        let value = if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            let (value, remaining) = match after_eq.chars().next() {
                Some(q @ ('"' | '\'')) => {
                    let body = &after_eq[1..];
                    let end = body.find(q).unwrap_or(body.len());
                    (&body[..end], body.get(end + 1..).unwrap_or(""))
                }
                _ => {
                    let end = after_eq
                        .find(char::is_whitespace)
                        .unwrap_or(after_eq.len());
                    (&after_eq[..end], &after_eq[end..])
                }
            };
            rest = remaining;
            Some(value)
        } else {
            None
        };

        if name.eq_ignore_ascii_case(wanted) {
            return value.map(str::to_string);
        }
        if name.is_empty() && value.is_none() {
            return None;
        }
    }
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest.find(';').and_then(|semi| {
            let entity = &rest[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi + 1))
        });

        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &rest[len..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Split an href into its path and query (fragment dropped).
fn split_href(href: &str) -> (&str, &str) {
    let href = href.split_once('#').map_or(href, |(h, _)| h);
    href.split_once('?').unwrap_or((href, ""))
}

/// Modification time of a listing line as Unix seconds, 0 if none found.
///
/// The last two whitespace-separated tokens are the link; the date and time
/// columns sit somewhere before them with single digits space-padded.
pub(crate) fn line_timestamp(line: &str) -> i64 {
    let columns = strip_last_tokens(line, 2)
        .replace("- ", "-0")
        .replace(": ", ":0");

    let tokens: Vec<&str> = columns.split_whitespace().collect();
    tokens
        .windows(2)
        .find_map(|pair| parse_date_time(pair[0], pair[1]))
        .and_then(|naive| local_epoch(&Local, naive))
        .unwrap_or(0)
}

/// Unix seconds of a wall-clock time in `tz`. An ambiguous time takes the
/// earlier instant; a time skipped by a forward transition is read with the
/// offset in force before it, which lands just past the gap.
fn local_epoch<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<i64> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.timestamp()),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.timestamp()),
        LocalResult::None => tz
            .from_local_datetime(&(naive + TimeDelta::hours(1)))
            .earliest()
            .map(|dt| dt.timestamp()),
    }
}

fn strip_last_tokens(line: &str, count: usize) -> &str {
    let mut rest = line.trim_end();
    for _ in 0..count {
        match rest.rfind(char::is_whitespace) {
            Some(pos) => rest = rest[..pos].trim_end(),
            None => return rest,
        }
    }
    rest
}

fn parse_date_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let [y, mo, d] = numeric_fields(date, '-')?;
    let [h, mi, s] = numeric_fields(time, ':')?;
    let date = NaiveDate::from_ymd_opt(i32::try_from(y).ok()?, mo, d)?;
    let time = NaiveTime::from_hms_opt(h, mi, s)?;
    Some(date.and_time(time))
}

fn numeric_fields(token: &str, sep: char) -> Option<[u32; 3]> {
    let mut parts = token.split(sep);
    let mut out = [0u32; 3];
    for slot in &mut out {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }
    parts.next().is_none().then_some(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::FixedOffset;

    use super::*;

    const URL: &str = "http://192.168.4.1/dir?dir=A:";

    fn local_ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap().timestamp()
    }

    fn page(lines: &[&str]) -> String {
        format!(
            "<html><head><title>ez Share</title></head><body>\n<h1>Directory A:</h1><pre>\n{}\n</pre><hr></body></html>",
            lines.join("\n")
        )
    }

    #[test]
    fn parses_files_and_dirs_in_listing_order() {
        let html = page(&[
            r#"   2023- 1-15   13: 5:22         &lt;DIR&gt;   <a href="dir?dir=A:%5CDATALOG"> DATALOG</a>"#,
            r#"   2023- 1-15   13: 5:40          4KB    <a href="download?file=STR.EDF"> STR.EDF</a>"#,
            r#"   2022-12- 3    9:30: 1        120KB    <a href="download?file=Identification.tgt"> Identification.tgt</a>"#,
            r#"   2023- 2- 1    0: 0: 0         &lt;DIR&gt;   <a href="dir?dir=A:%5CSETTINGS"> SETTINGS</a>"#,
        ]);

        let listing = parse_listing(&html, URL, &ListingRules::default()).unwrap();

        assert_eq!(
            listing.files,
            vec![
                RemoteFile {
                    name: "STR.edf".into(),
                    query: "file=STR.EDF".into(),
                    modified: local_ts(2023, 1, 15, 13, 5, 40),
                },
                RemoteFile {
                    name: "Identification.tgt".into(),
                    query: "file=Identification.tgt".into(),
                    modified: local_ts(2022, 12, 3, 9, 30, 1),
                },
            ]
        );
        assert_eq!(
            listing.dirs,
            vec![
                RemoteDir {
                    name: "DATALOG".into(),
                    href: "dir?dir=A:%5CDATALOG".into(),
                },
                RemoteDir {
                    name: "SETTINGS".into(),
                    href: "dir?dir=A:%5CSETTINGS".into(),
                },
            ]
        );
    }

    #[test]
    fn missing_pre_block_is_a_parse_error() {
        let err = parse_listing("<html><body>busy</body></html>", URL, &ListingRules::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::Parse { .. }), "{err}");
    }

    #[test]
    fn empty_pre_block_is_an_empty_listing() {
        let listing = parse_listing("<PRE>\n\n</PRE>", URL, &ListingRules::default()).unwrap();
        assert!(listing.is_empty());
    }

    #[test]
    fn hidden_ignored_and_parent_entries_are_dropped() {
        let html = page(&[
            r#"   2023- 1-15   13: 5:22   &lt;DIR&gt;   <a href="dir?dir=A:">.</a>"#,
            r#"   2023- 1-15   13: 5:22   &lt;DIR&gt;   <a href="dir?dir=">..</a>"#,
            r#"   2023- 1-15   13: 5:22   &lt;DIR&gt;   <a href="dir?dir=A:%5C.Spotlight-V100"> .Spotlight-V100</a>"#,
            r#"   2023- 1-15   13: 5:22      1KB   <a href="download?file=JOURNAL.JNL"> JOURNAL.JNL</a>"#,
            r#"   2023- 1-15   13: 5:22      1KB   <a href="download?file=SETTINGS.TGT"> SETTINGS.TGT</a>"#,
        ]);
        let rules = ListingRules {
            ignore: HashSet::from(["JOURNAL.JNL".to_string()]),
            ..Default::default()
        };

        let listing = parse_listing(&html, URL, &rules).unwrap();

        assert!(listing.dirs.is_empty());
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].name, "SETTINGS.TGT");
    }

    #[test]
    fn unknown_link_kinds_are_dropped() {
        let html = page(&[
            r#"   2023- 1-15   13: 5:22      1KB   <a href="upload?file=X"> X</a>"#,
            r#"   some banner text without a link"#,
        ]);
        let listing = parse_listing(&html, URL, &ListingRules::default()).unwrap();
        assert!(listing.is_empty());
    }

    #[test]
    fn unparseable_timestamp_is_zero() {
        let html = page(&[r#"   ????-??-??   ??:??:??   1KB   <a href="download?file=A.EDF"> A.EDF</a>"#]);
        let listing = parse_listing(&html, URL, &ListingRules::default()).unwrap();
        assert_eq!(
            listing.files,
            vec![RemoteFile {
                name: "A.EDF".into(),
                query: "file=A.EDF".into(),
                modified: 0,
            }]
        );
    }

    #[test]
    fn invalid_calendar_date_is_zero() {
        assert_eq!(
            line_timestamp(r#"2023-13-45   25:61:00   1KB   <a href="download?file=A"> A</a>"#),
            0
        );
    }

    #[test]
    fn zero_padded_timestamps_parse_too() {
        let ts = line_timestamp(r#"  2024-03-09   07:08:09   1KB   <a href="download?file=A"> A</a>"#);
        assert_eq!(ts, local_ts(2024, 3, 9, 7, 8, 9));
    }

    /// UTC-5 until 2023-03-12 02:00 local, UTC-4 from 03:00 local.
    #[derive(Debug, Clone, Copy)]
    struct SpringForward;

    impl SpringForward {
        const CHANGE_UTC: i64 = 1_678_604_400; // 2023-03-12 07:00 UTC

        fn std() -> FixedOffset {
            FixedOffset::west_opt(5 * 3600).unwrap()
        }

        fn dst() -> FixedOffset {
            FixedOffset::west_opt(4 * 3600).unwrap()
        }

        fn gap() -> (NaiveDateTime, NaiveDateTime) {
            let day = NaiveDate::from_ymd_opt(2023, 3, 12).unwrap();
            (day.and_hms_opt(2, 0, 0).unwrap(), day.and_hms_opt(3, 0, 0).unwrap())
        }
    }

    impl TimeZone for SpringForward {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let (start, end) = Self::gap();
            if *local < start {
                LocalResult::Single(Self::std())
            } else if *local >= end {
                LocalResult::Single(Self::dst())
            } else {
                LocalResult::None
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if utc.and_utc().timestamp() < Self::CHANGE_UTC {
                Self::std()
            } else {
                Self::dst()
            }
        }
    }

    #[test]
    fn time_inside_spring_forward_gap_still_has_an_instant() {
        let at = |h, mi| {
            let naive = NaiveDate::from_ymd_opt(2023, 3, 12)
                .unwrap()
                .and_hms_opt(h, mi, 0)
                .unwrap();
            local_epoch(&SpringForward, naive)
        };

        assert_eq!(at(1, 30), Some(1_678_602_600));
        assert_eq!(at(2, 30), Some(1_678_606_200));
        assert_eq!(at(3, 30), Some(1_678_606_200));
    }

    #[test]
    fn entities_in_names_and_hrefs_are_decoded() {
        let html = page(&[
            r#"   2023- 1-15   13: 5:22      1KB   <A HREF='download?file=R%26D.TXT&amp;x=1'> R&amp;D.TXT </A>"#,
        ]);
        let listing = parse_listing(&html, URL, &ListingRules::default()).unwrap();
        assert_eq!(
            listing.files,
            vec![RemoteFile {
                name: "R&D.TXT".into(),
                query: "file=R%26D.TXT&x=1".into(),
                modified: local_ts(2023, 1, 15, 13, 5, 22),
            }]
        );
    }

    #[test]
    fn anchor_text_loses_inner_markup() {
        let anchor = find_anchor(r#"x <a class="f" href="dir?dir=A:%5CX"><b>X</b></a>"#).unwrap();
        assert_eq!(
            anchor,
            Anchor {
                href: "dir?dir=A:%5CX".into(),
                text: "X".into(),
            }
        );
    }

    #[test]
    fn abbr_tags_are_not_anchors() {
        assert_eq!(find_anchor("<abbr>no</abbr>"), None);
    }

    #[test]
    fn href_split_keeps_query_and_drops_fragment() {
        assert_eq!(split_href("download?file=A#top"), ("download", "file=A"));
        assert_eq!(split_href("/dir"), ("/dir", ""));
    }
}
