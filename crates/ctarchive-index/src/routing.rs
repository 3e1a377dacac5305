//! Request route parsing
//!
//! Parsing is total: every path either produces exactly one [`Route`] variant
//! or is rejected, and rejection maps to 404 at the HTTP layer. To avoid
//! traversal tricks and encoding ambiguity the parser rejects any path
//! containing `%` (no percent-decoding is ever performed) or the substring
//! `..`.

/// A parsed request route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /logs.v3.json`
    LogList,
    /// `GET /metrics`
    Metrics,
    /// `GET /<log>/checkpoint`
    Checkpoint { log: String },
    /// `GET /<log>/log.v3.json`
    LogInfo { log: String },
    /// `GET /<log>/issuer/<fingerprint>`
    Issuer { log: String, fingerprint: String },
    /// `GET /<log>/tile/<L>/<N...>[.p/<W>]`
    HashTile {
        log: String,
        level: u8,
        index: u64,
        partial_width: Option<u8>,
        /// The zip entry name, preserved verbatim from the request path.
        entry_path: String,
    },
    /// `GET /<log>/tile/data/<N...>[.p/<W>]`
    DataTile {
        log: String,
        index: u64,
        partial_width: Option<u8>,
        entry_path: String,
    },
}

impl Route {
    /// The log name for routes under `/<log>/...`.
    pub fn log(&self) -> Option<&str> {
        match self {
            Route::LogList | Route::Metrics => None,
            Route::Checkpoint { log }
            | Route::LogInfo { log }
            | Route::Issuer { log, .. }
            | Route::HashTile { log, .. }
            | Route::DataTile { log, .. } => Some(log),
        }
    }
}

/// Parse a request path into a route, or `None` if the path is not a
/// supported route or any parameter fails to validate.
pub fn parse(path: &str) -> Option<Route> {
    if !path.starts_with('/') {
        return None;
    }
    if path.contains('%') || path.contains("..") {
        return None;
    }

    match path {
        "/logs.v3.json" => return Some(Route::LogList),
        "/metrics" => return Some(Route::Metrics),
        _ => {}
    }

    let parts: Vec<&str> = path[1..].split('/').collect();
    if parts.len() < 2 {
        return None;
    }

    let log = parts[0];
    if log.is_empty() || log == "." {
        return None;
    }

    let suffix = &parts[1..];
    if suffix.len() == 1 {
        return match suffix[0] {
            "checkpoint" => Some(Route::Checkpoint {
                log: log.to_string(),
            }),
            "log.v3.json" => Some(Route::LogInfo {
                log: log.to_string(),
            }),
            _ => None,
        };
    }

    match suffix[0] {
        "issuer" => {
            if suffix.len() != 2 {
                return None;
            }
            let fp = suffix[1];
            if !is_lower_hex(fp) {
                return None;
            }
            Some(Route::Issuer {
                log: log.to_string(),
                fingerprint: fp.to_string(),
            })
        }
        "tile" => parse_tile(log, suffix),
        _ => None,
    }
}

fn parse_tile(log: &str, suffix: &[&str]) -> Option<Route> {
    // suffix starts with "tile" and needs at least tile/<L|data>/<N>.
    if suffix.len() < 3 {
        return None;
    }

    if suffix[1] == "data" {
        let tile = parse_tile_index(&suffix[2..])?;
        return Some(Route::DataTile {
            log: log.to_string(),
            index: tile.index,
            partial_width: tile.partial_width,
            entry_path: format!("tile/data/{}", tile.entry),
        });
    }

    let level_seg = suffix[1];
    if level_seg.is_empty() || !level_seg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let level: u8 = level_seg.parse().ok()?;

    let tile = parse_tile_index(&suffix[2..])?;
    Some(Route::HashTile {
        log: log.to_string(),
        level,
        index: tile.index,
        partial_width: tile.partial_width,
        entry_path: format!("tile/{level_seg}/{}", tile.entry),
    })
}

struct TileIndex {
    index: u64,
    partial_width: Option<u8>,
    /// Entry-path segments for the `<N...>[.p/<W>]` portion, joined verbatim.
    entry: String,
}

/// Parse `<N...>` or `<N...>.p/<W>` from the segments following the level.
///
/// `N` is the groups-of-three tlog decimal form: every non-terminal segment
/// is `xDDD`, the terminal segment is `xDDD` or `DDD`; groups concatenate as
/// base-1000 digits. Overflow of u64 and widths outside [1, 255] reject.
fn parse_tile_index(parts: &[&str]) -> Option<TileIndex> {
    if parts.is_empty() {
        return None;
    }

    let partial = parts.len() >= 2 && parts[parts.len() - 2].ends_with(".p");
    let (n_parts, width_seg) = if partial {
        (&parts[..parts.len() - 1], Some(parts[parts.len() - 1]))
    } else {
        (parts, None)
    };

    let partial_width = match width_seg {
        Some(w) => {
            if w.is_empty() || !w.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let v: u16 = w.parse().ok()?;
            if !(1..=255).contains(&v) {
                return None;
            }
            Some(v as u8)
        }
        None => None,
    };

    let mut index: u64 = 0;
    let last = n_parts.len() - 1;
    for (i, seg) in n_parts.iter().enumerate() {
        let seg = if partial && i == last {
            seg.strip_suffix(".p")?
        } else {
            seg
        };
        let digits = if i < last {
            seg.strip_prefix('x')?
        } else {
            seg.strip_prefix('x').unwrap_or(seg)
        };
        if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let group: u64 = digits.parse().ok()?;
        index = index.checked_mul(1000)?.checked_add(group)?;
    }

    let mut entry = n_parts.join("/");
    if let Some(w) = width_seg {
        entry.push('/');
        entry.push_str(w);
    }

    Some(TileIndex {
        index,
        partial_width,
        entry,
    })
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
