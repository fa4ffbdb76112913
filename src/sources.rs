//! Source resolution.
//!
//! Turns a mods directory plus an optional load-order file into the ordered
//! list of [`SourceUnit`]s the merge consumes. Rank 0 is the highest priority
//! (its files win every conflict); the base game is always the single
//! lowest-priority unit.
//!
//! ## Load-order formats
//!
//! ```text
//! # modlist.txt                      plain list          loadorder.csv
//! +Unofficial Patch                  Unofficial Patch    index,name,isActive,path
//! -Disabled Mod                      Better Rocks        0,Better Rocks,1,
//! *DLC: Dawnguard                    HD Trees            1,HD Trees,true,/mods/HD Trees
//! +HD Trees                                              2,Old Mod,0,
//! ```
//!
//! - Line formats: later lines win. The last active line is rank 0.
//! - CSV: rows sorted by `index` ascending, first row is rank 0; an empty `path`
//!   means `<mods_dir>/<name>`.
//! - `*` entries are unmanaged (game DLC) and ignored; `#` starts a comment.
//!
//! Without a load-order file every directory and mod archive directly inside the
//! mods directory is a unit, alphabetically, later names winning.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mods directory not found: {0}")]
    ModsDirMissing(PathBuf),
    #[error("game directory not found: {0}")]
    GameDirMissing(PathBuf),
    #[error("load order line {line}: {detail}")]
    LoadOrder { line: usize, detail: String },
}

/// Load-order files looked for inside the mods directory.
pub const DEFAULT_LOAD_ORDERS: &[&str] = &["modlist.txt", "loadorder.csv"];

/// Whole-mod archives that are extracted before merging.
const MOD_ARCHIVE_EXTENSIONS: &[&str] = &["7z", "zip", "rar"];

/// Name given to the base game unit.
pub const BASE_GAME_UNIT: &str = "<base game>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Loose files (possibly containing embedded BSA/BA2 archives).
    Directory,
    /// A packed mod (`.7z`/`.zip`/`.rar`), extracted whole before merging.
    Archive,
}

/// One mod's contribution to the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub name: String,
    pub root: PathBuf,
    /// 0 = highest priority.
    pub rank: usize,
    pub kind: UnitKind,
}

/// A parsed load-order row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOrderEntry {
    pub name: String,
    pub active: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrderFormat {
    /// `+active` / `-inactive` / `*unmanaged` lines.
    ModList,
    /// One active mod name per line.
    Plain,
    /// `index,name,isActive,path`.
    Csv,
}

/// Guess the format of a load-order file from its name and contents.
pub fn detect_format(path: &Path, content: &str) -> LoadOrderFormat {
    let is_csv_ext = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    let mut lines = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));
    if is_csv_ext {
        return LoadOrderFormat::Csv;
    }
    let Some(first) = lines.next() else {
        return LoadOrderFormat::Plain;
    };
    if first.matches(',').count() >= 2 {
        LoadOrderFormat::Csv
    } else if std::iter::once(first)
        .chain(lines)
        .any(|l| l.starts_with(['+', '-', '*']))
    {
        LoadOrderFormat::ModList
    } else {
        LoadOrderFormat::Plain
    }
}

fn parse_active_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parse a load-order file into entries, highest priority first.
///
/// Inactive and unmanaged entries are dropped.
pub fn parse_load_order(
    content: &str,
    format: LoadOrderFormat,
) -> Result<Vec<LoadOrderEntry>, SourceError> {
    match format {
        LoadOrderFormat::ModList | LoadOrderFormat::Plain => {
            let mut entries = Vec::new();
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (active, name) = match line.chars().next() {
                    Some('+') => (true, line[1..].trim()),
                    Some('-') => (false, line[1..].trim()),
                    Some('*') => continue,
                    _ => (true, line),
                };
                if active && !name.is_empty() {
                    entries.push(LoadOrderEntry {
                        name: name.to_string(),
                        active,
                        path: None,
                    });
                }
            }
            entries.reverse();
            Ok(entries)
        }
        LoadOrderFormat::Csv => parse_csv(content),
    }
}

fn parse_csv(content: &str) -> Result<Vec<LoadOrderEntry>, SourceError> {
    let mut rows: Vec<(i64, LoadOrderEntry)> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(4, ',').map(str::trim).collect();
        let Ok(index) = fields[0].parse::<i64>() else {
            if rows.is_empty() {
                // Header row
                continue;
            }
            return Err(SourceError::LoadOrder {
                line: line_no,
                detail: format!("bad index {:?}", fields[0]),
            });
        };
        if fields.len() < 3 {
            return Err(SourceError::LoadOrder {
                line: line_no,
                detail: "expected index,name,isActive[,path]".into(),
            });
        }
        let active = parse_active_flag(fields[2]).ok_or_else(|| SourceError::LoadOrder {
            line: line_no,
            detail: format!("bad isActive {:?}", fields[2]),
        })?;
        if !active || fields[1].is_empty() {
            continue;
        }
        let path = fields
            .get(3)
            .filter(|p| !p.is_empty())
            .map(|p| PathBuf::from(*p));
        rows.push((
            index,
            LoadOrderEntry {
                name: fields[1].to_string(),
                active,
                path,
            },
        ));
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, entry)| entry).collect())
}

fn is_mod_archive(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MOD_ARCHIVE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
            .unwrap_or(false)
}

fn unit_kind(path: &Path) -> Option<UnitKind> {
    if path.is_dir() {
        Some(UnitKind::Directory)
    } else if is_mod_archive(path) {
        Some(UnitKind::Archive)
    } else {
        None
    }
}

/// Locate the load-order file: the explicit one if it exists, else the first
/// default name inside the mods directory.
fn find_load_order(mods_dir: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "load order file not found; falling back");
    }
    DEFAULT_LOAD_ORDERS
        .iter()
        .map(|name| mods_dir.join(name))
        .find(|p| p.is_file())
}

/// Every directory and mod archive directly inside `mods_dir`, highest priority first.
fn listing_order(mods_dir: &Path) -> Result<Vec<(String, PathBuf)>, SourceError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(mods_dir)? {
        let path = entry?.path();
        if unit_kind(&path).is_some() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            found.push((name, path));
        }
    }
    found.sort_by(|a, b| {
        a.0.to_lowercase()
            .cmp(&b.0.to_lowercase())
            .then_with(|| a.0.cmp(&b.0))
    });
    found.reverse();
    Ok(found)
}

/// Map load-order entries onto the mods directory, highest priority first.
fn load_order_units(mods_dir: &Path, entries: Vec<LoadOrderEntry>) -> Vec<(String, PathBuf)> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for entry in entries {
        if !seen.insert(entry.name.to_lowercase()) {
            debug!(name = %entry.name, "duplicate load order entry ignored");
            continue;
        }
        let candidate = entry
            .path
            .clone()
            .unwrap_or_else(|| mods_dir.join(&entry.name));
        let resolved = if unit_kind(&candidate).is_some() {
            Some(candidate)
        } else {
            MOD_ARCHIVE_EXTENSIONS
                .iter()
                .map(|ext| mods_dir.join(format!("{}.{ext}", entry.name)))
                .find(|p| is_mod_archive(p))
        };
        match resolved {
            Some(path) => found.push((entry.name, path)),
            None => warn!(name = %entry.name, "load order names a mod that does not exist; skipped"),
        }
    }
    found
}

/// Resolve the ordered source units, rank 0 first, base game last.
pub fn resolve_sources(
    mods_dir: &Path,
    game_dir: &Path,
    load_order: Option<&Path>,
) -> Result<Vec<SourceUnit>, SourceError> {
    if !mods_dir.is_dir() {
        return Err(SourceError::ModsDirMissing(mods_dir.to_path_buf()));
    }
    if !game_dir.is_dir() {
        return Err(SourceError::GameDirMissing(game_dir.to_path_buf()));
    }

    let ordered = match find_load_order(mods_dir, load_order) {
        Some(path) => {
            let content = fs::read_to_string(&path)?;
            let format = detect_format(&path, &content);
            info!(path = %path.display(), ?format, "using load order");
            load_order_units(mods_dir, parse_load_order(&content, format)?)
        }
        None => {
            warn!(
                mods_dir = %mods_dir.display(),
                "no load order found; using alphabetical directory order"
            );
            listing_order(mods_dir)?
        }
    };

    let mut units: Vec<SourceUnit> = ordered
        .into_iter()
        .filter_map(|(name, root)| unit_kind(&root).map(|kind| (name, root, kind)))
        .enumerate()
        .map(|(rank, (name, root, kind))| SourceUnit {
            name,
            root,
            rank,
            kind,
        })
        .collect();

    let data = game_dir.join("Data");
    let base_root = if data.is_dir() {
        data
    } else {
        game_dir.to_path_buf()
    };
    units.push(SourceUnit {
        name: BASE_GAME_UNIT.to_string(),
        root: base_root,
        rank: units.len(),
        kind: UnitKind::Directory,
    });

    for unit in &units {
        debug!(rank = unit.rank, name = %unit.name, kind = ?unit.kind, "source unit");
    }
    info!(units = units.len(), "resolved source units");
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(entries: &[LoadOrderEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    // =========================================================================
    // parse_load_order tests
    // =========================================================================

    #[test]
    fn modlist_last_active_line_wins() {
        let content = "# header\n+Alpha\n-Beta\n*DLC: Dawnguard\n+Gamma\n\n";
        let entries = parse_load_order(content, LoadOrderFormat::ModList).unwrap();
        assert_eq!(names(&entries), vec!["Gamma", "Alpha"]);
    }

    #[test]
    fn plain_list_reversed() {
        let entries = parse_load_order("One\nTwo\nThree\n", LoadOrderFormat::Plain).unwrap();
        assert_eq!(names(&entries), vec!["Three", "Two", "One"]);
    }

    #[test]
    fn csv_sorted_by_index() {
        let content = "index,name,isActive,path\n\
                       2,Third,1,\n\
                       0,First,true,/elsewhere/First\n\
                       1,Off,no,\n\
                       1,Second,yes,\n";
        let entries = parse_load_order(content, LoadOrderFormat::Csv).unwrap();
        assert_eq!(names(&entries), vec!["First", "Second", "Third"]);
        assert_eq!(entries[0].path, Some(PathBuf::from("/elsewhere/First")));
        assert_eq!(entries[1].path, None);
    }

    #[test]
    fn csv_path_may_contain_commas() {
        let entries = parse_load_order("0,Mod,1,/a,b/c\n", LoadOrderFormat::Csv).unwrap();
        assert_eq!(entries[0].path, Some(PathBuf::from("/a,b/c")));
    }

    #[test]
    fn csv_bad_flag_is_error() {
        let result = parse_load_order("0,Mod,maybe,\n", LoadOrderFormat::Csv);
        assert!(matches!(result, Err(SourceError::LoadOrder { line: 1, .. })));
    }

    #[test]
    fn csv_bad_index_after_header_is_error() {
        let result = parse_load_order("0,A,1,\nx,B,1,\n", LoadOrderFormat::Csv);
        assert!(matches!(result, Err(SourceError::LoadOrder { line: 2, .. })));
    }

    #[test]
    fn detects_formats() {
        assert_eq!(
            detect_format(Path::new("order.csv"), "A\n"),
            LoadOrderFormat::Csv
        );
        assert_eq!(
            detect_format(Path::new("x.txt"), "0,A,1,\n"),
            LoadOrderFormat::Csv
        );
        assert_eq!(
            detect_format(Path::new("modlist.txt"), "# c\nPlain\n+Mod\n"),
            LoadOrderFormat::ModList
        );
        assert_eq!(
            detect_format(Path::new("list.txt"), "A\nB\n"),
            LoadOrderFormat::Plain
        );
    }

    // =========================================================================
    // resolve_sources tests
    // =========================================================================

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let mods = tmp.path().join("mods");
        let game = tmp.path().join("game");
        for dir in ["Alpha", "Beta", "Gamma"] {
            fs::create_dir_all(mods.join(dir)).unwrap();
        }
        fs::create_dir_all(game.join("Data")).unwrap();
        (tmp, mods, game)
    }

    #[test]
    fn resolves_from_default_modlist() {
        let (_tmp, mods, game) = setup();
        fs::write(mods.join("modlist.txt"), "+Alpha\n+Missing\n-Beta\n+Gamma\n").unwrap();

        let units = resolve_sources(&mods, &game, None).unwrap();
        let got: Vec<(&str, usize)> = units.iter().map(|u| (u.name.as_str(), u.rank)).collect();
        assert_eq!(
            got,
            vec![("Gamma", 0), ("Alpha", 1), (BASE_GAME_UNIT, 2)]
        );
        assert_eq!(units[2].root, game.join("Data"));
    }

    #[test]
    fn falls_back_to_alphabetical() {
        let (_tmp, mods, game) = setup();
        fs::write(mods.join("Delta.7z"), b"7z").unwrap();
        fs::write(mods.join("notes.txt"), b"ignored").unwrap();

        let units = resolve_sources(&mods, &game, None).unwrap();
        let got: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(got, vec!["Gamma", "Delta.7z", "Beta", "Alpha", BASE_GAME_UNIT]);
        assert_eq!(units[1].kind, UnitKind::Archive);
        assert!(units.iter().enumerate().all(|(i, u)| u.rank == i));
    }

    #[test]
    fn missing_explicit_load_order_is_soft() {
        let (tmp, mods, game) = setup();
        let units = resolve_sources(&mods, &game, Some(&tmp.path().join("gone.txt"))).unwrap();
        assert_eq!(units.len(), 4);
    }

    #[test]
    fn csv_load_order_resolves_archives_by_name() {
        let (tmp, mods, game) = setup();
        fs::write(mods.join("Packed.zip"), b"zip").unwrap();
        let csv = tmp.path().join("order.csv");
        fs::write(&csv, "0,Packed,1,\n1,Beta,1,\n").unwrap();

        let units = resolve_sources(&mods, &game, Some(&csv)).unwrap();
        assert_eq!(units[0].name, "Packed");
        assert_eq!(units[0].root, mods.join("Packed.zip"));
        assert_eq!(units[0].kind, UnitKind::Archive);
        assert_eq!(units[1].name, "Beta");
    }

    #[test]
    fn missing_mods_dir_is_fatal() {
        let (tmp, _mods, game) = setup();
        let result = resolve_sources(&tmp.path().join("nope"), &game, None);
        assert!(matches!(result, Err(SourceError::ModsDirMissing(_))));
    }

    #[test]
    fn game_dir_without_data_is_used_directly() {
        let (tmp, mods, _game) = setup();
        let bare = tmp.path().join("bare-game");
        fs::create_dir_all(&bare).unwrap();
        let units = resolve_sources(&mods, &bare, None).unwrap();
        assert_eq!(units.last().unwrap().root, bare);
    }
}
