use crate::{
    archive::{Archive, ProgressFn},
    definition::{
        self, normalize_crlf, BackupDefinition, SourceDefinition, BACKUP_DEFINITION_FILE,
        SOURCE_DEFINITION_FILE,
    },
    entry::{join_root, normalize_path, strip_root, Entry, EntryManifest},
    error::{self, ModError, OpResult},
    identity::{identity_hash, identity_of, parse_identity, Version},
};
use anyhow::{anyhow, Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::UNIX_EPOCH,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const SOURCE_EXTENSION: &str = "zip";
pub const BACKUP_EXTENSION: &str = "bak";
pub const BACKUP_DEFINITION_EXTENSION: &str = "xml";

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SourceState {
    pub path: PathBuf,
    pub is_dir: bool,
    pub root: String,
    pub entries: EntryManifest,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackupState {
    pub path: PathBuf,
    pub is_dir: bool,
    pub root: String,
    pub entries: EntryManifest,
    pub overlaps: Vec<u64>,
}

impl BackupState {
    pub fn store(&self) -> PathBuf {
        if self.is_dir {
            let parent = self.path.parent().unwrap_or_else(|| Path::new(""));
            parent.join(&self.root)
        } else {
            self.path.clone()
        }
    }
}

pub struct BackupContext<'a> {
    pub target_dir: &'a Path,
    pub backup_dir: &'a Path,
    /// Negative values select a plain directory backup.
    pub method: i32,
    pub level: i32,
    pub shared_dirs: &'a HashSet<String>,
    pub overlaps: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModStatus {
    pub missing_depend: bool,
    pub broken_depend: bool,
    pub overlapped: bool,
}

#[derive(Debug)]
pub struct ModPackage {
    pub hash: u64,
    pub identity: String,
    pub core_name: String,
    pub display_name: String,
    pub version: Option<Version>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<Thumbnail>,
    pub source: Option<SourceState>,
    pub backup: Option<BackupState>,
    pub status: ModStatus,
    pub last_error: String,
    op_progress: Arc<AtomicU32>,
}

impl Default for ModPackage {
    fn default() -> Self {
        Self::new()
    }
}

impl ModPackage {
    pub fn new() -> Self {
        Self {
            hash: 0,
            identity: String::new(),
            core_name: String::new(),
            display_name: String::new(),
            version: None,
            category: None,
            description: None,
            thumbnail: None,
            source: None,
            backup: None,
            status: ModStatus::default(),
            last_error: String::new(),
            op_progress: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.has_backup()
    }

    pub fn is_ghost(&self) -> bool {
        self.source.is_none() && self.backup.is_none()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_ref().map(|source| source.path.as_path())
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_ref().map(|backup| backup.path.as_path())
    }

    pub fn source_entries(&self) -> Option<&EntryManifest> {
        self.source.as_ref().map(|source| &source.entries)
    }

    pub fn backup_entries(&self) -> Option<&EntryManifest> {
        self.backup.as_ref().map(|backup| &backup.entries)
    }

    pub fn dependencies(&self) -> &[String] {
        self.source
            .as_ref()
            .map(|source| source.dependencies.as_slice())
            .unwrap_or(&[])
    }

    pub fn overlap_hashes(&self) -> &[u64] {
        self.backup
            .as_ref()
            .map(|backup| backup.overlaps.as_slice())
            .unwrap_or(&[])
    }

    /// Entries the mod touches in the target: the backup when installed,
    /// otherwise the source.
    pub fn committed_entries(&self) -> Option<&EntryManifest> {
        self.backup_entries().or_else(|| self.source_entries())
    }

    pub fn progress_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.op_progress)
    }

    pub fn progress(&self) -> u32 {
        self.op_progress.load(Ordering::Relaxed)
    }

    pub fn reset_progress(&self) {
        self.op_progress.store(0, Ordering::Relaxed);
    }

    pub fn clear_source(&mut self) {
        self.source = None;
        if self.backup.is_none() {
            self.category = None;
            self.description = None;
            self.thumbnail = None;
        }
    }

    pub fn clear_backup(&mut self) {
        self.backup = None;
    }

    fn set_identity(&mut self, identity: &str, hash: u64) {
        let parsed = parse_identity(identity);
        self.identity = identity.to_string();
        self.hash = hash;
        self.core_name = parsed.core_name;
        self.display_name = parsed.display_name;
        self.version = parsed.version;
    }

    fn fail(&mut self, err: anyhow::Error) -> OpResult {
        let result = error::result_for(&err);
        self.last_error = error::summarize(&err);
        warn!(mod_ident = %self.identity, result = %result, "{}", self.last_error);
        result
    }

    pub fn reparse_source(&mut self) -> Result<()> {
        let path = self
            .source_path()
            .map(Path::to_path_buf)
            .ok_or(ModError::NoSource)?;
        self.parse_source(&path)
    }

    pub fn parse_source(&mut self, path: &Path) -> Result<()> {
        let result = self.parse_source_inner(path);
        if let Err(err) = &result {
            self.last_error = error::summarize(err);
        }
        result
    }

    fn parse_source_inner(&mut self, path: &Path) -> Result<()> {
        let identity =
            identity_of(path).with_context(|| format!("no identity for source {path:?}"))?;
        let hash = identity_hash(&identity);
        if let Some(_backup) = &self.backup {
            if self.hash != hash || self.identity != identity {
                return Err(ModError::IdentityMismatch {
                    source_ident: identity,
                    backup_ident: self.identity.clone(),
                }
                .into());
            }
        }

        let parsed = if path.is_dir() {
            parse_directory_source(path, &identity)?
        } else {
            parse_archive_source(path, &identity)?
        };

        self.set_identity(&identity, hash);
        self.category = parsed.category;
        self.description = parsed.description;
        self.thumbnail = parsed.thumbnail;
        self.source = Some(parsed.state);
        debug!(mod_ident = %self.identity, "parsed source {:?}", path);
        Ok(())
    }

    pub fn parse_backup(&mut self, path: &Path) -> Result<()> {
        let result = self.parse_backup_inner(path);
        if let Err(err) = &result {
            self.last_error = error::summarize(err);
        }
        result
    }

    fn parse_backup_inner(&mut self, path: &Path) -> Result<()> {
        let is_dir = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(BACKUP_DEFINITION_EXTENSION));
        let def = if is_dir {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read backup definition {path:?}"))?;
            definition::parse_backup_definition(&raw)?
        } else {
            let mut archive = Archive::open_for_read(path)?;
            let index = archive.rlocate_entry(BACKUP_DEFINITION_FILE).ok_or_else(|| {
                ModError::Definition(format!("{BACKUP_DEFINITION_FILE} not found in {path:?}"))
            })?;
            let raw = archive.extract_to_memory(index)?;
            let raw = String::from_utf8(raw)
                .map_err(|_| ModError::Definition("backup definition is not UTF-8".into()))?;
            definition::parse_backup_definition(&raw)?
        };

        if self.source.is_some() && (self.hash != def.hash || self.identity != def.ident) {
            return Err(ModError::IdentityMismatch {
                source_ident: self.identity.clone(),
                backup_ident: def.ident,
            }
            .into());
        }
        if self.source.is_none() {
            self.set_identity(&def.ident, def.hash);
        }
        self.backup = Some(BackupState {
            path: path.to_path_buf(),
            is_dir,
            root: def.backup_root,
            entries: def.entries,
            overlaps: def.overlaps,
        });
        debug!(mod_ident = %self.identity, "parsed backup {:?}", path);
        Ok(())
    }

    /// Files the source would touch if installed now; entries whose target does
    /// not exist yet are flagged for deletion on uninstall.
    pub fn footprint(&self, target_dir: &Path) -> EntryManifest {
        let Some(source) = &self.source else {
            return EntryManifest::new();
        };
        source
            .entries
            .iter()
            .map(|entry| {
                let mut entry = entry.clone();
                entry.delete_marker = !entry.resolve(target_dir).exists();
                entry
            })
            .collect()
    }

    pub fn make_backup(&mut self, ctx: &BackupContext<'_>, progress: &mut ProgressFn<'_>) -> OpResult {
        if self.backup.is_some() {
            return self.fail(ModError::AlreadyBackedUp.into());
        }
        let Some(source) = self.source.as_ref() else {
            return self.fail(ModError::NoSource.into());
        };
        let entries = source.entries.clone();
        let dir_mode = ctx.method < 0;
        let root = self.identity.clone();
        let (state_path, store) = if dir_mode {
            (
                ctx.backup_dir
                    .join(format!("{}.{BACKUP_DEFINITION_EXTENSION}", self.identity)),
                ctx.backup_dir.join(&root),
            )
        } else {
            let path = ctx
                .backup_dir
                .join(format!("{}.{BACKUP_EXTENSION}", self.identity));
            (path.clone(), path)
        };

        let mut archive = if dir_mode {
            if let Err(err) = fs::create_dir_all(&store).context("create backup dir") {
                return self.fail(err);
            }
            None
        } else {
            match Archive::open_for_write(&store, ctx.method, ctx.level) {
                Ok(archive) => Some(archive),
                Err(err) => return self.fail(err),
            }
        };

        info!(mod_ident = %self.identity, "backing up {} entries", entries.len());
        let meter = self.progress_handle();
        let total = entries.len() as u64;
        let mut saved = EntryManifest::new();
        let mut next_index: i64 = 0;
        let mut failure: Option<anyhow::Error> = None;

        for (i, entry) in entries.iter().enumerate() {
            meter.store(percent(i as u64, total), Ordering::Relaxed);
            if !progress(total, i as u64) {
                failure = Some(ModError::Aborted.into());
                break;
            }
            let target = entry.resolve(ctx.target_dir);
            let step = (|| -> Result<()> {
                let meta = match fs::symlink_metadata(&target) {
                    Ok(meta) => meta,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        let mut created = entry.clone();
                        created.delete_marker = true;
                        created.archive_index = -1;
                        saved.push(created);
                        return Ok(());
                    }
                    Err(err) => return Err(err).with_context(|| format!("stat {target:?}")),
                };
                if meta.is_dir() {
                    if !entry.is_dir {
                        return Err(anyhow!("{target:?} is a directory, expected a file"));
                    }
                    if ctx.shared_dirs.contains(&entry.path) {
                        saved.push(Entry::dir(&entry.path).marked_for_delete());
                    } else {
                        saved.push(Entry::dir(&entry.path));
                    }
                    if archive.is_none() {
                        let dest = entry.resolve(&store);
                        fs::create_dir_all(&dest)
                            .with_context(|| format!("create backup dir {dest:?}"))?;
                    }
                    return Ok(());
                }
                if entry.is_dir {
                    return Err(anyhow!("{target:?} is a file, expected a directory"));
                }
                match archive.as_mut() {
                    Some(archive) => {
                        archive.add_from_file(&target, &join_root(&root, &entry.path))?;
                        saved.push(Entry::file(&entry.path).with_index(next_index));
                        next_index += 1;
                        fs::remove_file(&target)
                            .with_context(|| format!("remove backed up file {target:?}"))?;
                    }
                    None => {
                        let dest = entry.resolve(&store);
                        move_file(&target, &dest)?;
                        saved.push(Entry::file(&entry.path).with_index(next_index));
                        next_index += 1;
                    }
                }
                Ok(())
            })();
            if let Err(err) = step {
                failure = Some(err);
                break;
            }
        }

        let overlaps = if failure.is_none() {
            ctx.overlaps.clone()
        } else {
            Vec::new()
        };
        if failure.is_none() {
            let def = BackupDefinition {
                ident: self.identity.clone(),
                hash: self.hash,
                backup_root: root.clone(),
                entries: saved.clone(),
                overlaps: overlaps.clone(),
            };
            let written = definition::write_backup_definition(&def).and_then(|bytes| {
                match archive.as_mut() {
                    Some(archive) => archive.add_from_memory(&bytes, BACKUP_DEFINITION_FILE),
                    None => fs::write(&state_path, bytes)
                        .with_context(|| format!("write backup definition {state_path:?}")),
                }
            });
            if let Err(err) = written {
                failure = Some(err);
            }
        }
        if let Some(mut archive) = archive.take() {
            if let Err(err) = archive.close() {
                if failure.is_none() {
                    failure = Some(err);
                } else {
                    warn!(mod_ident = %self.identity, "close partial backup: {}", archive.last_error());
                }
            }
        }

        // Partial state stays recorded so an undo pass can put moved files back.
        self.backup = Some(BackupState {
            path: state_path,
            is_dir: dir_mode,
            root,
            entries: saved,
            overlaps,
        });

        match failure {
            Some(err) => self.fail(err),
            None => {
                meter.store(100, Ordering::Relaxed);
                progress(total, total);
                OpResult::Ok
            }
        }
    }

    pub fn apply_source(&mut self, target_dir: &Path, progress: &mut ProgressFn<'_>) -> OpResult {
        let Some(source) = self.source.as_ref() else {
            return self.fail(ModError::NoSource.into());
        };
        let source = source.clone();
        let mut archive = if source.is_dir {
            None
        } else {
            match Archive::open_for_read(&source.path) {
                Ok(archive) => Some(archive),
                Err(err) => return self.fail(err),
            }
        };

        info!(mod_ident = %self.identity, "applying {} entries", source.entries.len());
        let meter = self.progress_handle();
        let total = source.entries.len() as u64;
        for (i, entry) in source.entries.iter().enumerate() {
            meter.store(percent(i as u64, total), Ordering::Relaxed);
            if !progress(total, i as u64) {
                return self.fail(ModError::Aborted.into());
            }
            let target = entry.resolve(target_dir);
            let step = (|| -> Result<()> {
                if entry.is_dir {
                    if !target.is_dir() {
                        fs::create_dir_all(&target)
                            .with_context(|| format!("create dir {target:?}"))?;
                    }
                    return Ok(());
                }
                match archive.as_mut() {
                    Some(archive) => {
                        let index = usize::try_from(entry.archive_index)
                            .map_err(|_| anyhow!("entry {} has no archive index", entry.path))?;
                        archive.extract_to_file(index, &target)
                    }
                    None => {
                        let from = entry.resolve(&source.path);
                        copy_file(&from, &target)
                    }
                }
            })();
            if let Err(err) = step {
                return self.fail(err);
            }
        }
        meter.store(100, Ordering::Relaxed);
        progress(total, total);
        OpResult::Ok
    }

    /// Puts saved files back, deletes created ones and removes the backup store.
    /// With `is_undo`, a missing backup is a no-op and progress runs backward.
    pub fn restore_data(
        &mut self,
        target_dir: &Path,
        progress: &mut ProgressFn<'_>,
        is_undo: bool,
    ) -> OpResult {
        let Some(backup) = self.backup.as_ref() else {
            if is_undo {
                return OpResult::Ok;
            }
            return self.fail(ModError::NoBackup.into());
        };
        let backup = backup.clone();
        let store = backup.store();
        let copies: Vec<&Entry> = backup.entries.copies().collect();
        let deletions = backup.entries.deletion_order();
        let needs_archive = !backup.is_dir && copies.iter().any(|entry| !entry.is_dir);
        let mut archive = if needs_archive {
            match Archive::open_for_read(&store) {
                Ok(archive) => Some(archive),
                Err(err) => return self.fail(err),
            }
        } else {
            None
        };

        info!(mod_ident = %self.identity, undo = is_undo, "restoring {} entries", backup.entries.len());
        let meter = self.progress_handle();
        let total = (copies.len() + deletions.len()) as u64;
        let mut done: u64 = 0;
        let mut tick = |done: u64| -> bool {
            let current = if is_undo { total - done } else { done };
            meter.store(percent(current, total), Ordering::Relaxed);
            progress(total, current)
        };

        for entry in &copies {
            if !tick(done) {
                return self.fail(ModError::Aborted.into());
            }
            let target = entry.resolve(target_dir);
            let step = (|| -> Result<()> {
                if entry.is_dir {
                    if !target.is_dir() {
                        fs::create_dir_all(&target)
                            .with_context(|| format!("recreate dir {target:?}"))?;
                    }
                    return Ok(());
                }
                match archive.as_mut() {
                    Some(archive) => {
                        let index = usize::try_from(entry.archive_index)
                            .map_err(|_| anyhow!("saved entry {} has no archive index", entry.path))?;
                        archive.extract_to_file(index, &target)
                    }
                    None => copy_file(&entry.resolve(&store), &target),
                }
            })();
            if let Err(err) = step {
                return self.fail(err);
            }
            done += 1;
        }

        for entry in &deletions {
            if !tick(done) {
                return self.fail(ModError::Aborted.into());
            }
            let target = entry.resolve(target_dir);
            if let Err(err) = remove_created(&target) {
                return self.fail(err);
            }
            done += 1;
        }
        drop(archive);

        let removed = if backup.is_dir {
            remove_dir_if_present(&store).and_then(|_| remove_file_if_present(&backup.path))
        } else {
            remove_file_if_present(&store)
        };
        if let Err(err) = removed {
            return self.fail(err.context("delete backup store"));
        }

        self.backup = None;
        tick(done);
        OpResult::Ok
    }

    /// Re-packs the source into a distributable archive at `dest`.
    /// The destination is only replaced once the new archive is complete.
    pub fn save_as(
        &mut self,
        dest: &Path,
        method: i32,
        level: i32,
        progress: &mut ProgressFn<'_>,
    ) -> Result<()> {
        let result = self.save_as_inner(dest, method, level, progress);
        if let Err(err) = &result {
            self.last_error = error::summarize(err);
        }
        result
    }

    fn save_as_inner(
        &self,
        dest: &Path,
        method: i32,
        level: i32,
        progress: &mut ProgressFn<'_>,
    ) -> Result<()> {
        let source = self.source.as_ref().ok_or(ModError::NoSource)?;
        let root = identity_of(dest).with_context(|| format!("no identity for {dest:?}"))?;
        let file_name = dest.file_name().context("destination file name")?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp = dest.with_file_name(temp_name);

        let written = (|| -> Result<()> {
            let mut out = Archive::open_for_write(&temp, method.max(0), level)?;
            let mut input = if source.is_dir {
                None
            } else {
                Some(Archive::open_for_read(&source.path)?)
            };
            out.add_directory(&root)?;
            let total = source.entries.len() as u64;
            for (i, entry) in source.entries.iter().enumerate() {
                if !progress(total, i as u64) {
                    return Err(ModError::Aborted.into());
                }
                let name = join_root(&root, &entry.path);
                if entry.is_dir {
                    out.add_directory(&name)?;
                    continue;
                }
                match input.as_mut() {
                    Some(input) => {
                        let index = usize::try_from(entry.archive_index)
                            .map_err(|_| anyhow!("entry {} has no archive index", entry.path))?;
                        let data = input.extract_to_memory(index)?;
                        out.add_from_memory(&data, &name)?;
                    }
                    None => out.add_from_file(&entry.resolve(&source.path), &name)?,
                }
            }

            let mut def = SourceDefinition {
                install: root.clone(),
                dependencies: source.dependencies.clone(),
                category: self.category.clone(),
                description: self.description.clone(),
                picture: None,
            };
            if let Some(thumbnail) = &self.thumbnail {
                let leaf = thumbnail
                    .name
                    .rsplit('/')
                    .next()
                    .unwrap_or(&thumbnail.name)
                    .to_string();
                out.add_from_memory(&thumbnail.data, &leaf)?;
                def.picture = Some(leaf);
            }
            if def.description.is_none() {
                out.add_from_memory(self.generated_readme().as_bytes(), "readme.txt")?;
            }
            let bytes = definition::write_source_definition(&def)?;
            out.add_from_memory(&bytes, SOURCE_DEFINITION_FILE)?;
            out.close()?;
            progress(total, total);
            Ok(())
        })();

        if let Err(err) = written {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
        if let Err(err) = fs::rename(&temp, dest) {
            let _ = fs::remove_file(&temp);
            return Err(err).with_context(|| format!("replace {dest:?}"));
        }
        info!(mod_ident = %self.identity, "saved source as {:?}", dest);
        Ok(())
    }

    fn generated_readme(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.display_name);
        out.push_str("\r\n");
        if let Some(version) = &self.version {
            out.push_str(&format!("Version: {version}\r\n"));
        }
        if let Some(category) = &self.category {
            out.push_str(&format!("Category: {category}\r\n"));
        }
        let deps = self.dependencies();
        if !deps.is_empty() {
            out.push_str("Dependencies:\r\n");
            for dep in deps {
                out.push_str(&format!("  {dep}\r\n"));
            }
        }
        out
    }
}

struct ParsedSource {
    state: SourceState,
    category: Option<String>,
    description: Option<String>,
    thumbnail: Option<Thumbnail>,
}

fn parse_directory_source(path: &Path, identity: &str) -> Result<ParsedSource> {
    let mut entries = EntryManifest::new();
    for item in WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|item| !is_ignored_name(&item.file_name().to_string_lossy()))
    {
        let item = item.with_context(|| format!("walk source {path:?}"))?;
        let rel = item.path().strip_prefix(path).context("source relative path")?;
        let rel = normalize_path(&rel.to_string_lossy());
        if item.file_type().is_dir() {
            entries.push_unique(Entry::dir(rel));
        } else {
            entries.push_unique(Entry::file(rel));
        }
    }

    let core_name = parse_identity(identity).core_name;
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let description = [identity, core_name.as_str()]
        .iter()
        .map(|name| parent.join(format!("{name}.txt")))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| fs::read(candidate).ok())
        .map(|bytes| normalize_crlf(&String::from_utf8_lossy(&bytes)));
    let thumbnail = [identity, core_name.as_str()]
        .iter()
        .flat_map(|name| {
            IMAGE_EXTENSIONS
                .iter()
                .map(move |ext| parent.join(format!("{name}.{ext}")))
        })
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| {
            let data = fs::read(&candidate).ok()?;
            let name = candidate.file_name()?.to_string_lossy().to_string();
            Some(Thumbnail { name, data })
        });

    Ok(ParsedSource {
        state: SourceState {
            path: path.to_path_buf(),
            is_dir: true,
            root: String::new(),
            entries,
            dependencies: Vec::new(),
        },
        category: None,
        description,
        thumbnail,
    })
}

fn parse_archive_source(path: &Path, identity: &str) -> Result<ParsedSource> {
    let mut archive = Archive::open_for_read(path)?;
    let def_index = archive.rlocate_entry(SOURCE_DEFINITION_FILE);

    let (root, dependencies, category, mut description, thumbnail) = match def_index {
        Some(index) => {
            let raw = archive.extract_to_memory(index)?;
            let raw = String::from_utf8_lossy(&raw);
            let def = definition::parse_source_definition(&raw)
                .with_context(|| format!("parse {SOURCE_DEFINITION_FILE} in {path:?}"))?;
            let thumbnail = def.picture.as_ref().and_then(|picture| {
                let index = archive.locate_entry(picture)?;
                let data = archive.extract_to_memory(index).ok()?;
                Some(Thumbnail {
                    name: picture.clone(),
                    data,
                })
            });
            (def.install, def.dependencies, def.category, def.description, thumbnail)
        }
        None => {
            let root = identity.to_string();
            let count = archive.entry_count();
            let has_root = (0..count).any(|index| {
                archive
                    .entry_path(index)
                    .map(|name| strip_root(&normalize_path(&name), &root).is_some())
                    .unwrap_or(false)
            });
            if !has_root {
                return Err(ModError::UnknownArchitecture {
                    path: path.to_path_buf(),
                    prefix: root,
                }
                .into());
            }
            (root, Vec::new(), None, None, None)
        }
    };

    if def_index.is_none() || description.is_none() {
        let readme = ["readme.txt".to_string(), join_root(&root, "readme.txt")]
            .iter()
            .find_map(|name| archive.rlocate_entry(name));
        if let Some(index) = readme {
            if let Ok(bytes) = archive.extract_to_memory(index) {
                description = Some(normalize_crlf(&String::from_utf8_lossy(&bytes)));
            }
        }
    }

    let mut entries = EntryManifest::new();
    for index in 0..archive.entry_count() {
        if Some(index) == def_index {
            continue;
        }
        let name = normalize_path(&archive.entry_path(index)?);
        let Some(rel) = strip_root(&name, &root) else {
            continue;
        };
        if rel.is_empty() || is_ignored_name(rel.rsplit('/').next().unwrap_or(rel)) {
            continue;
        }
        if archive.entry_is_dir(index)? {
            entries.push_with_parents(Entry::dir(rel));
        } else {
            entries.push_with_parents(Entry::file(rel).with_index(index as i64));
        }
    }

    Ok(ParsedSource {
        state: SourceState {
            path: path.to_path_buf(),
            is_dir: false,
            root,
            entries,
            dependencies,
        },
        category,
        description,
        thumbnail,
    })
}

fn is_ignored_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("__MACOSX")
        || name.eq_ignore_ascii_case(".ds_store")
        || name.eq_ignore_ascii_case("thumbs.db")
}

fn percent(current: u64, total: u64) -> u32 {
    if total == 0 {
        return 100;
    }
    ((current.min(total) * 100) / total) as u32
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    fs::copy(from, to).with_context(|| format!("copy {from:?} -> {to:?}"))?;
    preserve_mtime(from, to);
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_file(from, to)?;
    fs::remove_file(from).with_context(|| format!("remove moved file {from:?}"))?;
    Ok(())
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, duration.subsec_nanos());
    let _ = set_file_mtime(dest, mtime);
}

fn remove_created(target: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("stat {target:?}")),
    };
    if meta.is_dir() {
        let empty = fs::read_dir(target)
            .with_context(|| format!("list {target:?}"))?
            .next()
            .is_none();
        if empty {
            fs::remove_dir(target).with_context(|| format!("remove dir {target:?}"))?;
        }
        return Ok(());
    }
    fs::remove_file(target).with_context(|| format!("remove file {target:?}"))
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {path:?}")),
    }
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {path:?}")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn keep_going() -> impl FnMut(u64, u64) -> bool {
        |_, _| true
    }

    pub(crate) fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, body) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
    }

    pub(crate) fn snapshot(root: &Path) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for item in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let item = item.unwrap();
            let rel = item
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            if item.file_type().is_dir() {
                out.push((rel, "/".to_string()));
            } else {
                out.push((rel, fs::read_to_string(item.path()).unwrap()));
            }
        }
        out
    }

    struct Fixture {
        _temp: TempDir,
        library: PathBuf,
        backups: PathBuf,
        target: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");
        let backups = temp.path().join("backups");
        let target = temp.path().join("target");
        for dir in [&library, &backups, &target] {
            fs::create_dir_all(dir).unwrap();
        }
        Fixture {
            _temp: temp,
            library,
            backups,
            target,
        }
    }

    fn ctx<'a>(fx: &'a Fixture, method: i32, shared: &'a HashSet<String>) -> BackupContext<'a> {
        BackupContext {
            target_dir: &fx.target,
            backup_dir: &fx.backups,
            method,
            level: 6,
            shared_dirs: shared,
            overlaps: vec![99],
        }
    }

    fn build_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
        let mut archive = Archive::open_for_write(path, 8, 6).unwrap();
        for (name, body) in entries {
            match body {
                Some(body) => archive.add_from_memory(body.as_bytes(), name).unwrap(),
                None => archive.add_directory(name).unwrap(),
            }
        }
        archive.close().unwrap();
    }

    #[test]
    fn test_parse_directory_source_preorder() {
        let fx = fixture();
        let src = fx.library.join("Sky_Box_v1.2");
        write_tree(&src, &[("textures/sky.dds", "sky"), ("readme.md", "r")]);
        fs::write(fx.library.join("Sky_Box_v1.2.txt"), "about\nsky").unwrap();

        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        assert_eq!(pkg.identity, "Sky_Box_v1.2");
        assert_eq!(pkg.core_name, "Sky Box");
        assert_eq!(pkg.version.as_ref().unwrap().to_string(), "1.2");
        assert_eq!(pkg.hash, identity_hash("Sky_Box_v1.2"));
        assert_eq!(pkg.description.as_deref(), Some("about\r\nsky"));
        let paths: Vec<&str> = pkg
            .source_entries()
            .unwrap()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, vec!["readme.md", "textures", "textures/sky.dds"]);
    }

    #[test]
    fn test_parse_archive_source_with_definition() {
        let fx = fixture();
        let path = fx.library.join("Better_Sky_v2.0.zip");
        let def = SourceDefinition {
            install: "content".to_string(),
            dependencies: vec!["Core_Lib>=1.0".to_string()],
            category: Some("Visual".to_string()),
            description: Some("nice".to_string()),
            picture: Some("thumb.png".to_string()),
        };
        let xml = String::from_utf8(definition::write_source_definition(&def).unwrap()).unwrap();
        build_zip(
            &path,
            &[
                ("content/", None),
                ("content/sky/a.dds", Some("a")),
                ("outside.txt", Some("skip me")),
                ("thumb.png", Some("PNG")),
                (SOURCE_DEFINITION_FILE, Some(xml.as_str())),
            ],
        );

        let mut pkg = ModPackage::new();
        pkg.parse_source(&path).unwrap();
        assert_eq!(pkg.identity, "Better_Sky_v2.0");
        assert_eq!(pkg.dependencies(), ["Core_Lib>=1.0".to_string()]);
        assert_eq!(pkg.category.as_deref(), Some("Visual"));
        assert_eq!(pkg.thumbnail.as_ref().unwrap().data, b"PNG");
        let source = pkg.source.as_ref().unwrap();
        assert_eq!(source.root, "content");
        let paths: Vec<(&str, bool)> = source
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.is_dir))
            .collect();
        assert_eq!(paths, vec![("sky", true), ("sky/a.dds", false)]);
        assert_eq!(source.entries.get(1).unwrap().archive_index, 1);
    }

    #[test]
    fn test_parse_legacy_archive_requires_root() {
        let fx = fixture();
        let good = fx.library.join("Old_Mod.zip");
        build_zip(
            &good,
            &[("Old_Mod/data/x.bin", Some("x")), ("Old_Mod/readme.txt", Some("hi\nthere"))],
        );
        let mut pkg = ModPackage::new();
        pkg.parse_source(&good).unwrap();
        assert_eq!(pkg.description.as_deref(), Some("hi\r\nthere"));
        assert!(pkg.source_entries().unwrap().contains_path("data/x.bin"));

        let bad = fx.library.join("Other_Mod.zip");
        build_zip(&bad, &[("stray/x.bin", Some("x"))]);
        let mut pkg = ModPackage::new();
        let err = pkg.parse_source(&bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::UnknownArchitecture { .. })
        ));
        assert!(!pkg.has_source());
        assert!(!pkg.last_error.is_empty());
    }

    #[test]
    fn test_backup_then_restore_roundtrip_directory_source() {
        for method in [8, -1] {
            let fx = fixture();
            let src = fx.library.join("ModA");
            write_tree(
                &src,
                &[("cfg/x.ini", "new x"), ("cfg/deep/n.txt", "new"), ("top.txt", "new top")],
            );
            write_tree(&fx.target, &[("cfg/x.ini", "old x"), ("keep.txt", "keep")]);
            let before = snapshot(&fx.target);

            let mut pkg = ModPackage::new();
            pkg.parse_source(&src).unwrap();
            let shared = HashSet::new();
            let mut go = keep_going();
            assert_eq!(pkg.make_backup(&ctx(&fx, method, &shared), &mut go), OpResult::Ok);
            assert!(pkg.has_backup());
            assert_eq!(pkg.overlap_hashes(), [99]);
            assert!(!fx.target.join("cfg/x.ini").exists());

            assert_eq!(pkg.apply_source(&fx.target, &mut go), OpResult::Ok);
            assert_eq!(fs::read_to_string(fx.target.join("cfg/x.ini")).unwrap(), "new x");

            assert_eq!(pkg.restore_data(&fx.target, &mut go, false), OpResult::Ok);
            assert!(!pkg.has_backup());
            assert_eq!(snapshot(&fx.target), before);
            assert!(fs::read_dir(&fx.backups).unwrap().next().is_none());
        }
    }

    #[test]
    fn test_backup_definition_persisted_and_reparsed() {
        let fx = fixture();
        let src = fx.library.join("ModB");
        write_tree(&src, &[("cfg/x.ini", "b"), ("data/y.dat", "y")]);
        write_tree(&fx.target, &[("cfg/x.ini", "original")]);

        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let shared: HashSet<String> = ["cfg".to_string()].into_iter().collect();
        let mut go = keep_going();
        assert_eq!(pkg.make_backup(&ctx(&fx, 8, &shared), &mut go), OpResult::Ok);
        let bak = fx.backups.join("ModB.bak");
        assert!(bak.is_file());

        let mut reloaded = ModPackage::new();
        reloaded.parse_backup(&bak).unwrap();
        assert_eq!(reloaded.identity, "ModB");
        assert_eq!(reloaded.hash, pkg.hash);
        let entries = reloaded.backup_entries().unwrap();
        let copies: Vec<&str> = entries.copies().map(|e| e.path.as_str()).collect();
        let deletions: Vec<&str> = entries.deletions().map(|e| e.path.as_str()).collect();
        assert_eq!(copies, vec!["cfg/x.ini"]);
        assert_eq!(deletions, vec!["cfg", "data", "data/y.dat"]);

        reloaded.parse_source(&src).unwrap();
        assert!(reloaded.has_source() && reloaded.has_backup());
    }

    #[test]
    fn test_parse_source_rejects_identity_mismatch() {
        let fx = fixture();
        let src = fx.library.join("ModA");
        write_tree(&src, &[("a.txt", "a")]);
        let other = fx.library.join("ModZ");
        write_tree(&other, &[("z.txt", "z")]);

        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let shared = HashSet::new();
        let mut go = keep_going();
        assert_eq!(pkg.make_backup(&ctx(&fx, -1, &shared), &mut go), OpResult::Ok);
        pkg.clear_source();

        let err = pkg.parse_source(&other).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::IdentityMismatch { .. })
        ));
        assert!(!pkg.has_source());
        assert_eq!(pkg.identity, "ModA");
    }

    #[test]
    fn test_parse_backup_without_hash_fails() {
        let fx = fixture();
        let def = fx.backups.join("ModA.xml");
        fs::write(
            &def,
            "<backup_definition version=\"1\"><ident>ModA</ident><backup>ModA</backup></backup_definition>",
        )
        .unwrap();
        let mut pkg = ModPackage::new();
        assert!(pkg.parse_backup(&def).is_err());
        assert!(!pkg.has_backup());
    }

    #[test]
    fn test_make_backup_preconditions_abort() {
        let fx = fixture();
        let shared = HashSet::new();
        let mut go = keep_going();
        let mut pkg = ModPackage::new();
        assert_eq!(pkg.make_backup(&ctx(&fx, 8, &shared), &mut go), OpResult::Abort);
        assert_eq!(pkg.restore_data(&fx.target, &mut go, false), OpResult::Abort);
        assert_eq!(pkg.restore_data(&fx.target, &mut go, true), OpResult::Ok);
    }

    #[test]
    fn test_apply_failure_then_undo_restores_target() {
        let fx = fixture();
        let src = fx.library.join("ModC");
        write_tree(
            &src,
            &[
                ("a.txt", "new a"),
                ("b.txt", "new b"),
                ("c.txt", "new c"),
                ("d.txt", "new d"),
                ("e.txt", "new e"),
            ],
        );
        write_tree(&fx.target, &[("a.txt", "old a"), ("d.txt", "old d"), ("e.txt", "old e")]);
        let before = snapshot(&fx.target);

        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        fs::remove_file(src.join("d.txt")).unwrap();

        let shared = HashSet::new();
        let mut go = keep_going();
        assert_eq!(pkg.make_backup(&ctx(&fx, 8, &shared), &mut go), OpResult::Ok);
        assert_eq!(pkg.apply_source(&fx.target, &mut go), OpResult::Error);
        assert!(pkg.last_error.contains("d.txt"));
        assert_eq!(fs::read_to_string(fx.target.join("c.txt")).unwrap(), "new c");

        let mut seen = Vec::new();
        let mut record = |_total: u64, current: u64| {
            seen.push(current);
            true
        };
        assert_eq!(pkg.restore_data(&fx.target, &mut record, true), OpResult::Ok);
        assert_eq!(snapshot(&fx.target), before);
        assert!(seen.windows(2).all(|pair| pair[0] >= pair[1]));
        assert_eq!(seen.last(), Some(&0));
    }

    #[test]
    fn test_make_backup_abort_keeps_partial_state() {
        let fx = fixture();
        let src = fx.library.join("ModD");
        write_tree(&src, &[("a.txt", "1"), ("b.txt", "2"), ("c.txt", "3")]);
        write_tree(&fx.target, &[("a.txt", "old a"), ("b.txt", "old b"), ("c.txt", "old c")]);
        let before = snapshot(&fx.target);

        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let shared = HashSet::new();
        let mut stop_after_two = |_total: u64, current: u64| current < 2;
        assert_eq!(
            pkg.make_backup(&ctx(&fx, 8, &shared), &mut stop_after_two),
            OpResult::Abort
        );
        assert!(pkg.has_backup());
        assert_eq!(pkg.backup_entries().unwrap().len(), 2);
        assert!(!fx.target.join("a.txt").exists());

        let mut go = keep_going();
        assert_eq!(pkg.restore_data(&fx.target, &mut go, true), OpResult::Ok);
        assert_eq!(snapshot(&fx.target), before);
        assert!(!fx.backups.join("ModD.bak").exists());
    }

    #[test]
    fn test_make_backup_io_error_stops_loop() {
        let fx = fixture();
        let src = fx.library.join("ModF");
        write_tree(&src, &[("a.txt", "1"), ("sub/b.txt", "2"), ("z.txt", "3")]);
        write_tree(&fx.target, &[("a.txt", "old a"), ("sub/b.txt", "old b"), ("z.txt", "old z")]);
        // A plain file where the backup needs the `sub` directory.
        fs::create_dir_all(fx.backups.join("ModF")).unwrap();
        fs::write(fx.backups.join("ModF/sub"), "blocker").unwrap();

        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let shared = HashSet::new();
        let mut go = keep_going();
        assert_eq!(pkg.make_backup(&ctx(&fx, -1, &shared), &mut go), OpResult::Error);
        assert!(pkg.has_backup());
        let saved = pkg.backup_entries().unwrap();
        assert!(saved.contains_path("a.txt"));
        assert!(!saved.contains_path("sub/b.txt"));
        assert!(!saved.contains_path("z.txt"));
        assert!(!fx.target.join("a.txt").exists());
        assert_eq!(fs::read_to_string(fx.target.join("sub/b.txt")).unwrap(), "old b");
        assert_eq!(fs::read_to_string(fx.target.join("z.txt")).unwrap(), "old z");
        assert!(pkg.last_error.contains("create backup dir"));
    }

    #[test]
    fn test_restore_keeps_non_empty_created_dir() {
        let fx = fixture();
        let src = fx.library.join("ModE");
        write_tree(&src, &[("new_dir/f.txt", "f")]);
        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let shared = HashSet::new();
        let mut go = keep_going();
        assert_eq!(pkg.make_backup(&ctx(&fx, -1, &shared), &mut go), OpResult::Ok);
        assert_eq!(pkg.apply_source(&fx.target, &mut go), OpResult::Ok);
        fs::write(fx.target.join("new_dir/user.txt"), "mine").unwrap();

        assert_eq!(pkg.restore_data(&fx.target, &mut go, false), OpResult::Ok);
        assert!(!fx.target.join("new_dir/f.txt").exists());
        assert!(fx.target.join("new_dir/user.txt").exists());
    }

    #[test]
    fn test_footprint_flags_new_paths() {
        let fx = fixture();
        let src = fx.library.join("ModF");
        write_tree(&src, &[("cfg/x.ini", "x"), ("cfg/y.ini", "y")]);
        write_tree(&fx.target, &[("cfg/x.ini", "old")]);
        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let footprint = pkg.footprint(&fx.target);
        let flags: Vec<(&str, bool)> = footprint
            .iter()
            .map(|e| (e.path.as_str(), e.delete_marker))
            .collect();
        assert_eq!(flags, vec![("cfg", false), ("cfg/x.ini", false), ("cfg/y.ini", true)]);
    }

    #[test]
    fn test_save_as_repacks_directory_source() {
        let fx = fixture();
        let src = fx.library.join("Pack_v1.0");
        write_tree(&src, &[("data/a.txt", "a")]);
        fs::write(fx.library.join("Pack_v1.0.png"), "PNGDATA").unwrap();
        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        pkg.category = Some("Tools".to_string());

        let dest = fx.library.join("Pack_v1.1.zip");
        let mut go = keep_going();
        pkg.save_as(&dest, 8, 6, &mut go).unwrap();
        assert!(!fx.library.join("Pack_v1.1.zip.tmp").exists());

        let mut repacked = ModPackage::new();
        repacked.parse_source(&dest).unwrap();
        assert_eq!(repacked.identity, "Pack_v1.1");
        assert_eq!(repacked.category.as_deref(), Some("Tools"));
        assert_eq!(repacked.thumbnail.as_ref().unwrap().data, b"PNGDATA");
        assert!(repacked.description.as_deref().unwrap().starts_with("Pack"));
        assert!(repacked.source_entries().unwrap().contains_path("data/a.txt"));
    }

    #[test]
    fn test_save_as_abort_leaves_destination_untouched() {
        let fx = fixture();
        let src = fx.library.join("Pack");
        write_tree(&src, &[("a.txt", "a"), ("b.txt", "b")]);
        let dest = fx.library.join("Out.zip");
        fs::write(&dest, "previous").unwrap();
        let mut pkg = ModPackage::new();
        pkg.parse_source(&src).unwrap();
        let mut stop = |_total: u64, current: u64| current < 1;
        assert!(pkg.save_as(&dest, 8, 6, &mut stop).is_err());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "previous");
        assert!(!fx.library.join("Out.zip.tmp").exists());
    }
}
