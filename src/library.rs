use crate::{
    archive::ProgressFn,
    config::ChannelConfig,
    entry::EntryManifest,
    error::{self, ModError, OpResult},
    identity::{core_names_match, identity_of, DependencyFilter, Version},
    net::{NetPackage, NetRepo},
    package::{
        BackupContext, ModPackage, BACKUP_DEFINITION_EXTENSION, BACKUP_EXTENSION,
        SOURCE_EXTENSION,
    },
};
use anyhow::{Context, Result};
use std::{
    cmp::Ordering,
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModSortKey {
    Name,
    Version,
    Category,
    Installed,
}

impl ModSortKey {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "name" => Some(ModSortKey::Name),
            "version" => Some(ModSortKey::Version),
            "category" => Some(ModSortKey::Category),
            "installed" => Some(ModSortKey::Installed),
            _ => None,
        }
    }

    fn compare(self, a: &ModPackage, b: &ModPackage) -> Ordering {
        let primary = match self {
            ModSortKey::Name => Ordering::Equal,
            ModSortKey::Version => a.version.cmp(&b.version),
            ModSortKey::Category => a.category.cmp(&b.category),
            ModSortKey::Installed => b.is_installed().cmp(&a.is_installed()),
        };
        primary.then_with(|| display_cmp(a, b))
    }
}

fn display_cmp(a: &ModPackage, b: &ModPackage) -> Ordering {
    a.display_name
        .to_lowercase()
        .cmp(&b.display_name.to_lowercase())
        .then_with(|| a.identity.cmp(&b.identity))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub installs: Vec<u64>,
    pub overlaps: Vec<String>,
    pub extra_depends: Vec<u64>,
    pub missing_depends: Vec<String>,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePlan {
    pub restores: Vec<u64>,
    pub overlappers: Vec<u64>,
    pub dependents: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanPlan {
    pub restores: Vec<u64>,
    pub extra_depends: Vec<u64>,
    pub overlappers: Vec<u64>,
    pub dependents: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadPlan {
    pub downloads: Vec<u64>,
    pub extra_depends: Vec<u64>,
    pub missing_depends: Vec<String>,
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) -> bool {
    if list.contains(&value) {
        return false;
    }
    list.push(value);
    true
}

pub struct LibraryIndex {
    config: ChannelConfig,
    modpacks: Vec<ModPackage>,
    repos: Vec<NetRepo>,
    netpacks: Vec<NetPackage>,
}

impl LibraryIndex {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            modpacks: Vec::new(),
            repos: Vec::new(),
            netpacks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn modpacks(&self) -> &[ModPackage] {
        &self.modpacks
    }

    pub fn netpacks(&self) -> &[NetPackage] {
        &self.netpacks
    }

    pub fn repos(&self) -> &[NetRepo] {
        &self.repos
    }

    pub fn installed(&self) -> impl Iterator<Item = &ModPackage> {
        self.modpacks.iter().filter(|pkg| pkg.is_installed())
    }

    pub fn find_by_hash(&self, hash: u64) -> Option<&ModPackage> {
        self.modpacks.iter().find(|pkg| pkg.hash == hash)
    }

    pub fn find_by_hash_mut(&mut self, hash: u64) -> Option<&mut ModPackage> {
        self.modpacks.iter_mut().find(|pkg| pkg.hash == hash)
    }

    pub fn find_by_identity(&self, identity: &str) -> Option<&ModPackage> {
        self.modpacks.iter().find(|pkg| pkg.identity == identity)
    }

    pub fn find_net_by_hash(&self, hash: u64) -> Option<&NetPackage> {
        self.netpacks.iter().find(|pkg| pkg.hash == hash)
    }

    fn index_of(&self, hash: u64) -> Option<usize> {
        self.modpacks.iter().position(|pkg| pkg.hash == hash)
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.config.ensure_dirs()?;
        let sources = list_dir(&self.config.library_dir)?
            .into_iter()
            .filter(|path| is_source_path(path))
            .collect::<Vec<_>>();
        let backups = list_dir(&self.config.backup_dir)?
            .into_iter()
            .filter(|path| is_backup_path(path))
            .collect::<Vec<_>>();

        for pkg in &mut self.modpacks {
            if pkg.source_path().is_some_and(|path| !path.exists()) {
                pkg.clear_source();
            }
            if pkg.backup_path().is_some_and(|path| !path.exists()) {
                pkg.clear_backup();
            }
        }
        for path in &backups {
            if let Err(err) = self.attach_backup(path) {
                warn!("skipping backup {:?}: {}", path, error::summarize(&err));
            }
        }
        for path in &sources {
            if let Err(err) = self.attach_source(path) {
                warn!("skipping source {:?}: {}", path, error::summarize(&err));
            }
        }
        let removed = self.ghost_bust();
        self.refresh_analytics();
        info!(
            channel = %self.config.name,
            mods = self.modpacks.len(),
            removed,
            "library refreshed"
        );
        Ok(())
    }

    fn attach_source(&mut self, path: &Path) -> Result<bool> {
        let identity = identity_of(path).context("source has no identity")?;
        match self.modpacks.iter().position(|pkg| pkg.identity == identity) {
            Some(index) if self.modpacks[index].source_path() == Some(path) => Ok(false),
            Some(index) => {
                self.modpacks[index].parse_source(path)?;
                Ok(true)
            }
            None => {
                let mut pkg = ModPackage::new();
                pkg.parse_source(path)?;
                self.modpacks.push(pkg);
                Ok(true)
            }
        }
    }

    fn attach_backup(&mut self, path: &Path) -> Result<bool> {
        let identity = identity_of(path).context("backup has no identity")?;
        match self.modpacks.iter().position(|pkg| pkg.identity == identity) {
            Some(index) if self.modpacks[index].backup_path() == Some(path) => Ok(false),
            Some(index) => {
                self.modpacks[index].parse_backup(path)?;
                Ok(true)
            }
            None => {
                let mut pkg = ModPackage::new();
                pkg.parse_backup(path)?;
                self.modpacks.push(pkg);
                Ok(true)
            }
        }
    }

    pub fn notify_created(&mut self, path: &Path) -> Result<bool> {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let changed = if parent == self.config.library_dir && is_source_path(path) {
            self.attach_source(path)?
        } else if parent == self.config.backup_dir && is_backup_path(path) {
            self.attach_backup(path)?
        } else {
            false
        };
        if changed {
            self.refresh_analytics();
        }
        Ok(changed)
    }

    pub fn notify_deleted(&mut self, path: &Path) -> bool {
        let mut touched = None;
        for pkg in &mut self.modpacks {
            if pkg.source_path() == Some(path) {
                pkg.clear_source();
                touched = Some(pkg.hash);
            } else if pkg.backup_path() == Some(path) {
                pkg.clear_backup();
                touched = Some(pkg.hash);
            }
        }
        let Some(hash) = touched else {
            return false;
        };
        self.ghost_bust_one(hash);
        self.refresh_analytics();
        true
    }

    pub fn add_source(&mut self, path: &Path) -> Result<()> {
        self.attach_source(path)?;
        self.refresh_analytics();
        Ok(())
    }

    pub fn set_repo(&mut self, repo: NetRepo) {
        match self.repos.iter_mut().find(|known| known.url == repo.url) {
            Some(known) => *known = repo,
            None => self.repos.push(repo),
        }
        self.netpacks = self
            .repos
            .iter()
            .flat_map(|repo| repo.packages.iter().cloned())
            .collect();
    }

    pub fn can_overlap(&self, a: u64, b: u64) -> bool {
        let (Some(a), Some(b)) = (self.find_by_hash(a), self.find_by_hash(b)) else {
            return false;
        };
        match (a.committed_entries(), b.committed_entries()) {
            (Some(a), Some(b)) => a.overlaps(b),
            _ => false,
        }
    }

    /// Resolves a dependency reference. Constrained filters pick the highest
    /// satisfying version, ties going to the first in display order.
    pub fn find_dependency(&self, filter: &str, installed_only: bool) -> Option<&ModPackage> {
        let filter = DependencyFilter::parse(filter);
        let mut best: Option<&ModPackage> = None;
        for pkg in &self.modpacks {
            if installed_only && !pkg.is_installed() {
                continue;
            }
            if !filter.matches(&pkg.identity, &pkg.core_name, pkg.version.as_ref()) {
                continue;
            }
            best = match best {
                None => Some(pkg),
                Some(current) if prefer(&pkg.version, &current.version, || display_cmp(pkg, current)) => {
                    Some(pkg)
                }
                keep => keep,
            };
        }
        best
    }

    pub fn find_net_dependency(&self, filter: &str) -> Option<&NetPackage> {
        let filter = DependencyFilter::parse(filter);
        let mut best: Option<&NetPackage> = None;
        for pkg in &self.netpacks {
            if !filter.matches(&pkg.identity, &pkg.core_name, pkg.version.as_ref()) {
                continue;
            }
            best = match best {
                None => Some(pkg),
                Some(current)
                    if prefer(&pkg.version, &current.version, || {
                        pkg.identity.cmp(&current.identity)
                    }) =>
                {
                    Some(pkg)
                }
                keep => keep,
            };
        }
        best
    }

    fn install_closure(
        &self,
        hash: u64,
        visiting: &mut HashSet<u64>,
        out: &mut Vec<u64>,
        missing: &mut Vec<String>,
    ) {
        if out.contains(&hash) || !visiting.insert(hash) {
            return;
        }
        let Some(pkg) = self.find_by_hash(hash) else {
            return;
        };
        for dep in pkg.dependencies() {
            match self.find_dependency(dep, false) {
                None => {
                    push_unique(missing, dep.clone());
                }
                Some(found) if found.is_installed() => {}
                Some(found) => self.install_closure(found.hash, visiting, out, missing),
            }
        }
        push_unique(out, hash);
    }

    pub fn prepare_installs(&mut self, selection: &[u64]) -> InstallPlan {
        for hash in selection {
            if let Some(pkg) = self.find_by_hash_mut(*hash) {
                if pkg.has_source() {
                    if let Err(err) = pkg.reparse_source() {
                        warn!(mod_ident = %pkg.identity, "reparse failed: {}", error::summarize(&err));
                    }
                }
            }
        }

        let mut plan = InstallPlan::default();
        let mut candidates = Vec::new();
        let mut visiting = HashSet::new();
        for hash in selection {
            let Some(pkg) = self.find_by_hash(*hash) else {
                continue;
            };
            if pkg.is_installed() || !pkg.has_source() {
                continue;
            }
            self.install_closure(*hash, &mut visiting, &mut candidates, &mut plan.missing_depends);
        }
        plan.extra_depends = candidates
            .iter()
            .copied()
            .filter(|hash| !selection.contains(hash))
            .collect();

        // Footprints stay aligned with `candidates`; `plan.installs` may grow
        // with extra uninstall steps and must not be indexed in parallel.
        let target = self.config.target_dir.clone();
        let mut footprints: Vec<EntryManifest> = Vec::with_capacity(candidates.len());
        for (i, hash) in candidates.iter().enumerate() {
            let Some(pkg) = self.find_by_hash(*hash) else {
                footprints.push(EntryManifest::new());
                continue;
            };
            let footprint = pkg.footprint(&target);
            for j in 0..i {
                if !footprint.overlaps(&footprints[j]) {
                    continue;
                }
                let Some(earlier) = self.find_by_hash(candidates[j]) else {
                    continue;
                };
                if self.config.no_overlap {
                    push_unique(&mut plan.conflicts, earlier.identity.clone());
                    push_unique(&mut plan.conflicts, pkg.identity.clone());
                    plan.installs.push(candidates[j]);
                } else {
                    push_unique(&mut plan.overlaps, earlier.identity.clone());
                }
            }
            for installed in self.installed() {
                let Some(committed) = installed.backup_entries() else {
                    continue;
                };
                if !footprint.overlaps(committed) {
                    continue;
                }
                push_unique(&mut plan.overlaps, installed.identity.clone());
                if self.config.no_overlap && !plan.installs.contains(&installed.hash) {
                    plan.installs.push(installed.hash);
                }
            }
            plan.installs.push(*hash);
            footprints.push(footprint);
        }
        debug!(
            installs = plan.installs.len(),
            missing = plan.missing_depends.len(),
            conflicts = plan.conflicts.len(),
            "install plan ready"
        );
        plan
    }

    pub fn dependents_of(&self, hash: u64) -> Vec<u64> {
        self.installed()
            .filter(|pkg| pkg.hash != hash)
            .filter(|pkg| {
                pkg.dependencies().iter().any(|dep| {
                    self.find_dependency(dep, true)
                        .is_some_and(|found| found.hash == hash)
                })
            })
            .map(|pkg| pkg.hash)
            .collect()
    }

    pub fn overlappers_of(&self, hash: u64) -> Vec<u64> {
        self.installed()
            .filter(|pkg| pkg.hash != hash && pkg.overlap_hashes().contains(&hash))
            .map(|pkg| pkg.hash)
            .collect()
    }

    fn restore_closure(
        &self,
        hash: u64,
        selection: &[u64],
        visiting: &mut HashSet<u64>,
        plan: &mut RestorePlan,
    ) {
        if plan.restores.contains(&hash) || !visiting.insert(hash) {
            return;
        }
        for dependent in self.dependents_of(hash) {
            if !selection.contains(&dependent) && !visiting.contains(&dependent) {
                push_unique(&mut plan.dependents, dependent);
            }
            self.restore_closure(dependent, selection, visiting, plan);
        }
        for overlapper in self.overlappers_of(hash) {
            if !selection.contains(&overlapper) && !visiting.contains(&overlapper) {
                push_unique(&mut plan.overlappers, overlapper);
            }
            self.restore_closure(overlapper, selection, visiting, plan);
        }
        push_unique(&mut plan.restores, hash);
    }

    /// Builds the work list for uninstalling `selection`: dependents and mods
    /// installed on top come first, the selection last.
    pub fn prepare_restores(&self, selection: &[u64]) -> RestorePlan {
        let mut plan = RestorePlan::default();
        let mut visiting = HashSet::new();
        for hash in selection {
            if self.find_by_hash(*hash).is_some_and(ModPackage::is_installed) {
                self.restore_closure(*hash, selection, &mut visiting, &mut plan);
            }
        }
        plan
    }

    pub fn prepare_cleaning(&self, selection: &[u64]) -> CleanPlan {
        let mut restore = RestorePlan::default();
        let mut visiting = HashSet::new();
        for hash in selection {
            if self.find_by_hash(*hash).is_some_and(ModPackage::is_installed) {
                self.restore_closure(*hash, selection, &mut visiting, &mut restore);
            }
        }

        let mut extra = Vec::new();
        let mut pending: Vec<u64> = restore.restores.clone();
        while let Some(hash) = pending.pop() {
            let Some(pkg) = self.find_by_hash(hash) else {
                continue;
            };
            for dep in pkg.dependencies() {
                let Some(found) = self.find_dependency(dep, true) else {
                    continue;
                };
                if restore.restores.contains(&found.hash) {
                    continue;
                }
                let unused = self
                    .dependents_of(found.hash)
                    .iter()
                    .all(|dependent| restore.restores.contains(dependent));
                if !unused {
                    continue;
                }
                push_unique(&mut extra, found.hash);
                self.restore_closure(found.hash, selection, &mut visiting, &mut restore);
                pending.push(found.hash);
            }
        }

        CleanPlan {
            restores: restore.restores,
            extra_depends: extra,
            overlappers: restore.overlappers,
            dependents: restore.dependents,
        }
    }

    fn download_closure(
        &self,
        hash: u64,
        visiting: &mut HashSet<u64>,
        out: &mut Vec<u64>,
        missing: &mut Vec<String>,
    ) {
        if out.contains(&hash) || !visiting.insert(hash) {
            return;
        }
        let Some(pkg) = self.find_net_by_hash(hash) else {
            return;
        };
        for dep in &pkg.dependencies {
            if self.find_dependency(dep, false).is_some() {
                continue;
            }
            match self.find_net_dependency(dep) {
                Some(found) => self.download_closure(found.hash, visiting, out, missing),
                None => {
                    push_unique(missing, dep.clone());
                }
            }
        }
        push_unique(out, hash);
    }

    pub fn prepare_downloads(&self, selection: &[u64]) -> DownloadPlan {
        let mut plan = DownloadPlan::default();
        let mut visiting = HashSet::new();
        for hash in selection {
            self.download_closure(*hash, &mut visiting, &mut plan.downloads, &mut plan.missing_depends);
        }
        plan.extra_depends = plan
            .downloads
            .iter()
            .copied()
            .filter(|hash| !selection.contains(hash))
            .collect();
        plan
    }

    pub fn ghost_bust(&mut self) -> usize {
        let before = self.modpacks.len();
        self.modpacks.retain(|pkg| !pkg.is_ghost());
        before - self.modpacks.len()
    }

    pub fn ghost_bust_one(&mut self, hash: u64) -> bool {
        match self.index_of(hash) {
            Some(index) if self.modpacks[index].is_ghost() => {
                let pkg = self.modpacks.remove(index);
                debug!(mod_ident = %pkg.identity, "ghost removed");
                true
            }
            _ => false,
        }
    }

    pub fn sort_modpacks(&mut self, key: ModSortKey, ascending: bool) {
        self.modpacks.sort_by(|a, b| {
            let order = key.compare(a, b);
            if ascending {
                order
            } else {
                order.reverse()
            }
        });
    }

    pub fn refresh_analytics(&mut self) {
        let flags: Vec<(bool, bool, bool)> = self
            .modpacks
            .iter()
            .map(|pkg| {
                let missing = pkg
                    .dependencies()
                    .iter()
                    .any(|dep| self.find_dependency(dep, false).is_none());
                let broken = pkg.is_installed() && {
                    let mut visited = HashSet::from([pkg.hash]);
                    self.has_broken_depend(pkg, &mut visited)
                };
                let overlapped = pkg.is_installed() && !self.overlappers_of(pkg.hash).is_empty();
                (missing, broken, overlapped)
            })
            .collect();
        for (pkg, (missing, broken, overlapped)) in self.modpacks.iter_mut().zip(flags) {
            pkg.status.missing_depend = missing;
            pkg.status.broken_depend = broken;
            pkg.status.overlapped = overlapped;
        }
    }

    /// True when the mod's dependency chain reaches something not installed.
    /// Only the first declared dependency is followed at each level.
    pub fn has_broken_depend(&self, pkg: &ModPackage, visited: &mut HashSet<u64>) -> bool {
        let Some(dep) = pkg.dependencies().first() else {
            return false;
        };
        match self.find_dependency(dep, true) {
            None => true,
            Some(found) => visited.insert(found.hash) && self.has_broken_depend(found, visited),
        }
    }

    fn shared_dirs(&self, hash: u64) -> HashSet<String> {
        self.installed()
            .filter(|pkg| pkg.hash != hash)
            .filter_map(|pkg| pkg.backup_entries())
            .flat_map(|entries| entries.directory_paths().map(str::to_string))
            .collect()
    }

    fn installed_overlaps(&self, hash: u64) -> Vec<u64> {
        let Some(pkg) = self.find_by_hash(hash) else {
            return Vec::new();
        };
        let Some(source) = pkg.source_entries() else {
            return Vec::new();
        };
        self.installed()
            .filter(|other| other.hash != hash)
            .filter(|other| other.backup_entries().is_some_and(|entries| source.overlaps(entries)))
            .map(|other| other.hash)
            .collect()
    }

    pub fn install_mod(&mut self, hash: u64, progress: &mut ProgressFn<'_>) -> OpResult {
        let shared = self.shared_dirs(hash);
        let overlaps = self.installed_overlaps(hash);
        let Some(index) = self.index_of(hash) else {
            warn!(hash, "install requested for unknown mod");
            return OpResult::Abort;
        };
        let config = &self.config;
        let pkg = &mut self.modpacks[index];
        if pkg.has_backup() {
            pkg.last_error = ModError::AlreadyBackedUp.to_string();
            warn!(mod_ident = %pkg.identity, "install skipped: {}", pkg.last_error);
            return OpResult::Abort;
        }
        let ctx = BackupContext {
            target_dir: &config.target_dir,
            backup_dir: &config.backup_dir,
            method: config.backup_method,
            level: config.backup_level,
            shared_dirs: &shared,
            overlaps,
        };
        let mut result = pkg.make_backup(&ctx, progress);
        if result.is_ok() {
            result = pkg.apply_source(&config.target_dir, progress);
        }
        if !result.is_ok() {
            let message = pkg.last_error.clone();
            let mut quiet = |_: u64, _: u64| true;
            let undo = pkg.restore_data(&config.target_dir, &mut quiet, true);
            if !undo.is_ok() {
                warn!(mod_ident = %pkg.identity, "rollback failed: {}", pkg.last_error);
            }
            pkg.last_error = message;
            pkg.reset_progress();
        } else {
            info!(mod_ident = %pkg.identity, "installed");
        }
        self.refresh_analytics();
        result
    }

    pub fn uninstall_mod(&mut self, hash: u64, progress: &mut ProgressFn<'_>) -> OpResult {
        let Some(index) = self.index_of(hash) else {
            warn!(hash, "uninstall requested for unknown mod");
            return OpResult::Abort;
        };
        let target = self.config.target_dir.clone();
        let result = self.modpacks[index].restore_data(&target, progress, false);
        if result.is_ok() {
            info!(mod_ident = %self.modpacks[index].identity, "uninstalled");
            self.refresh_analytics();
        }
        self.ghost_bust_one(hash);
        result
    }

    pub fn supersede_targets(&self, hash: u64) -> Vec<u64> {
        let Some(pkg) = self.find_by_hash(hash) else {
            return Vec::new();
        };
        let Some(version) = pkg.version.as_ref() else {
            return Vec::new();
        };
        self.modpacks
            .iter()
            .filter(|other| other.hash != hash && core_names_match(&other.core_name, &pkg.core_name))
            .filter(|other| is_older(other.version.as_ref(), version))
            .map(|other| other.hash)
            .collect()
    }

    pub fn supersede_mod(&mut self, hash: u64, progress: &mut ProgressFn<'_>) -> OpResult {
        if !self.find_by_hash(hash).is_some_and(ModPackage::has_source) {
            return OpResult::Abort;
        }
        let mut was_installed = false;
        for old in self.supersede_targets(hash) {
            if self.find_by_hash(old).is_some_and(ModPackage::is_installed) {
                was_installed = true;
                let result = self.uninstall_mod(old, progress);
                if !result.is_ok() {
                    return result;
                }
            }
            if let Some(pkg) = self.find_by_hash_mut(old) {
                if let Some(path) = pkg.source_path().map(Path::to_path_buf) {
                    if let Err(err) = remove_source(&path) {
                        pkg.last_error = error::summarize(&err);
                        warn!(mod_ident = %pkg.identity, "{}", pkg.last_error);
                        return OpResult::Error;
                    }
                    pkg.clear_source();
                }
            }
            self.ghost_bust_one(old);
        }
        let already_installed = self.find_by_hash(hash).is_some_and(ModPackage::is_installed);
        let result = if was_installed && !already_installed {
            self.install_mod(hash, progress)
        } else {
            OpResult::Ok
        };
        self.refresh_analytics();
        result
    }

    pub fn last_error(&self, hash: u64) -> String {
        self.find_by_hash(hash)
            .map(|pkg| pkg.last_error.clone())
            .unwrap_or_else(|| ModError::NotFound(format!("{hash:016x}")).to_string())
    }
}

fn prefer(
    candidate: &Option<Version>,
    current: &Option<Version>,
    tie: impl FnOnce() -> Ordering,
) -> bool {
    match candidate.cmp(current) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => tie() == Ordering::Less,
    }
}

fn is_older(old: Option<&Version>, new: &Version) -> bool {
    match old {
        Some(old) => old < new,
        None => true,
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {dir:?}"))? {
        let entry = entry.with_context(|| format!("read {dir:?}"))?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}

fn is_source_path(path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    path.is_file() && has_extension(path, SOURCE_EXTENSION)
}

fn is_backup_path(path: &Path) -> bool {
    path.is_file()
        && (has_extension(path, BACKUP_EXTENSION) || has_extension(path, BACKUP_DEFINITION_EXTENSION))
}

fn remove_source(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("delete source {path:?}"))
    } else {
        fs::remove_file(path).with_context(|| format!("delete source {path:?}"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        archive::Archive,
        definition::{self, SourceDefinition, SOURCE_DEFINITION_FILE},
        identity::identity_hash,
        package::tests::{keep_going, snapshot, write_tree},
    };
    use tempfile::TempDir;

    pub(crate) fn library_in(temp: &TempDir, no_overlap: bool) -> LibraryIndex {
        let mut config = ChannelConfig::with_root("test", temp.path());
        config.no_overlap = no_overlap;
        config.ensure_dirs().unwrap();
        LibraryIndex::new(config)
    }

    pub(crate) fn dir_source(lib: &LibraryIndex, identity: &str, files: &[(&str, &str)]) -> u64 {
        write_tree(&lib.config().library_dir.join(identity), files);
        identity_hash(identity)
    }

    pub(crate) fn zip_source(
        lib: &LibraryIndex,
        identity: &str,
        deps: &[&str],
        files: &[(&str, &str)],
    ) -> u64 {
        let path = lib.config().library_dir.join(format!("{identity}.zip"));
        let mut archive = Archive::open_for_write(&path, 8, 6).unwrap();
        for (name, body) in files {
            archive
                .add_from_memory(body.as_bytes(), &format!("data/{name}"))
                .unwrap();
        }
        let def = SourceDefinition {
            install: "data".to_string(),
            dependencies: deps.iter().map(|dep| dep.to_string()).collect(),
            category: None,
            description: Some("test".to_string()),
            picture: None,
        };
        let bytes = definition::write_source_definition(&def).unwrap();
        archive.add_from_memory(&bytes, SOURCE_DEFINITION_FILE).unwrap();
        archive.close().unwrap();
        identity_hash(identity)
    }

    fn install(lib: &mut LibraryIndex, hash: u64) {
        let mut go = keep_going();
        assert_eq!(lib.install_mod(hash, &mut go), OpResult::Ok);
    }

    #[test]
    fn test_refresh_pairs_sources_and_backups() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let a = dir_source(&lib, "ModA", &[("cfg/x.ini", "a")]);
        lib.refresh().unwrap();
        install(&mut lib, a);

        let mut reloaded = LibraryIndex::new(lib.config().clone());
        reloaded.refresh().unwrap();
        assert_eq!(reloaded.modpacks().len(), 1);
        let pkg = reloaded.find_by_hash(a).unwrap();
        assert!(pkg.has_source() && pkg.has_backup());

        fs::remove_dir_all(lib.config().library_dir.join("ModA")).unwrap();
        reloaded.refresh().unwrap();
        let pkg = reloaded.find_by_hash(a).unwrap();
        assert!(!pkg.has_source() && pkg.has_backup());
    }

    #[test]
    fn test_notify_deleted_busts_ghost_and_sweep_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let a = dir_source(&lib, "ModA", &[("a.txt", "a")]);
        dir_source(&lib, "ModB", &[("b.txt", "b")]);
        lib.refresh().unwrap();
        assert_eq!(lib.modpacks().len(), 2);

        let path = lib.config().library_dir.join("ModA");
        fs::remove_dir_all(&path).unwrap();
        assert!(lib.notify_deleted(&path));
        assert!(lib.find_by_hash(a).is_none());
        assert_eq!(lib.ghost_bust(), 0);
        assert_eq!(lib.ghost_bust(), 0);
        assert_eq!(lib.modpacks().len(), 1);
    }

    #[test]
    fn test_notify_created_ignores_foreign_paths() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let a = dir_source(&lib, "ModA", &[("a.txt", "a")]);
        let stray = temp.path().join("elsewhere");
        write_tree(&stray, &[("x.txt", "x")]);
        assert!(!lib.notify_created(&stray).unwrap());
        let path = lib.config().library_dir.join("ModA");
        assert!(lib.notify_created(&path).unwrap());
        assert!(lib.find_by_hash(a).is_some());
    }

    #[test]
    fn test_can_overlap_is_symmetric() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let hashes = [
            dir_source(&lib, "ModA", &[("cfg/x.ini", "a")]),
            dir_source(&lib, "ModB", &[("cfg/x.ini", "b"), ("data/y.dat", "y")]),
            dir_source(&lib, "ModC", &[("cfg/z.ini", "c")]),
        ];
        lib.refresh().unwrap();
        for a in hashes {
            for b in hashes {
                assert_eq!(lib.can_overlap(a, b), lib.can_overlap(b, a));
            }
        }
        assert!(lib.can_overlap(hashes[0], hashes[1]));
        assert!(!lib.can_overlap(hashes[0], hashes[2]));
    }

    #[test]
    fn test_find_dependency_prefers_highest_version() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        dir_source(&lib, "Texture_Pack_v1.5", &[("t.dds", "1")]);
        dir_source(&lib, "Texture_Pack_v2.0", &[("t.dds", "2")]);
        let newest = dir_source(&lib, "Texture_Pack_v2.3", &[("t.dds", "3")]);
        lib.refresh().unwrap();

        let found = lib.find_dependency("Texture Pack>=2.0", false).unwrap();
        assert_eq!(found.hash, newest);
        let pinned = lib.find_dependency("Texture_Pack_v1.5", false).unwrap();
        assert_eq!(pinned.identity, "Texture_Pack_v1.5");
        assert!(lib.find_dependency("Texture Pack>=3", false).is_none());
        assert!(lib.find_dependency("Texture Pack>=2.0", true).is_none());
    }

    #[test]
    fn test_prepare_installs_dependencies_first() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let core = zip_source(&lib, "Core_v1.0", &[], &[("core.txt", "c")]);
        let ui = zip_source(&lib, "Ui_v1.0", &["Core>=1.0"], &[("ui.txt", "u")]);
        let app = zip_source(&lib, "App_v1.0", &["Ui_v1.0", "Missing>=2"], &[("app.txt", "a")]);
        lib.refresh().unwrap();

        let plan = lib.prepare_installs(&[app]);
        assert_eq!(plan.installs, vec![core, ui, app]);
        assert_eq!(plan.extra_depends, vec![core, ui]);
        assert_eq!(plan.missing_depends, vec!["Missing>=2".to_string()]);
        assert_eq!(lib.prepare_installs(&[app]), plan);
    }

    #[test]
    fn test_prepare_installs_skips_installed_dependency() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let core = zip_source(&lib, "Core_v1.0", &[], &[("core.txt", "c")]);
        let app = zip_source(&lib, "App_v1.0", &["Core>=1.0"], &[("app.txt", "a")]);
        lib.refresh().unwrap();
        install(&mut lib, core);

        let plan = lib.prepare_installs(&[app, core]);
        assert_eq!(plan.installs, vec![app]);
        assert!(plan.extra_depends.is_empty());
    }

    #[test]
    fn test_no_overlap_batch_conflict() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, true);
        let a = dir_source(&lib, "ModA", &[("cfg/x.ini", "a")]);
        let b = dir_source(&lib, "ModB", &[("cfg/x.ini", "b"), ("data/y.dat", "y")]);
        lib.refresh().unwrap();

        let plan = lib.prepare_installs(&[a, b]);
        assert!(plan.conflicts.contains(&"ModA".to_string()));
        assert!(plan.conflicts.contains(&"ModB".to_string()));
        assert_eq!(plan.installs, vec![a, a, b]);
    }

    #[test]
    fn test_overlap_allowed_reports_without_conflicts() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let a = dir_source(&lib, "ModA", &[("cfg/x.ini", "a")]);
        let b = dir_source(&lib, "ModB", &[("cfg/x.ini", "b")]);
        lib.refresh().unwrap();

        let plan = lib.prepare_installs(&[a, b]);
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.overlaps, vec!["ModA".to_string()]);
        assert_eq!(plan.installs, vec![a, b]);
    }

    #[test]
    fn test_conflict_labels_follow_candidates_not_install_list() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, true);
        let c = dir_source(&lib, "ModC", &[("shared/c.txt", "c")]);
        lib.refresh().unwrap();
        install(&mut lib, c);
        let a = dir_source(&lib, "ModA", &[("cfg/x.ini", "a")]);
        let b = dir_source(&lib, "ModB", &[("cfg/x.ini", "b"), ("shared/c.txt", "b")]);
        lib.refresh().unwrap();

        let plan = lib.prepare_installs(&[a, b]);
        assert_eq!(plan.installs, vec![a, a, c, b]);
        assert_eq!(plan.conflicts, vec!["ModA".to_string(), "ModB".to_string()]);
        assert_eq!(plan.overlaps, vec!["ModC".to_string()]);
    }

    #[test]
    fn test_install_records_overlap_and_restore_order() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let target = lib.config().target_dir.clone();
        write_tree(&target, &[("base.txt", "vanilla")]);
        let before = snapshot(&target);

        let a = zip_source(&lib, "ModA", &[], &[("base.txt", "a")]);
        let b = zip_source(&lib, "ModB", &["ModA"], &[("b.txt", "b")]);
        let c = zip_source(&lib, "ModC", &[], &[("base.txt", "c")]);
        lib.refresh().unwrap();
        for hash in lib.prepare_installs(&[b]).installs {
            install(&mut lib, hash);
        }
        install(&mut lib, c);
        assert_eq!(lib.find_by_hash(c).unwrap().overlap_hashes(), [a]);
        assert!(lib.find_by_hash(a).unwrap().status.overlapped);
        assert_eq!(fs::read_to_string(target.join("base.txt")).unwrap(), "c");

        let plan = lib.prepare_restores(&[a]);
        assert_eq!(plan.restores, vec![b, c, a]);
        assert_eq!(plan.dependents, vec![b]);
        assert_eq!(plan.overlappers, vec![c]);

        let mut go = keep_going();
        for hash in plan.restores {
            assert_eq!(lib.uninstall_mod(hash, &mut go), OpResult::Ok);
        }
        assert_eq!(snapshot(&target), before);
        assert_eq!(lib.installed().count(), 0);
    }

    #[test]
    fn test_prepare_cleaning_includes_unused_dependencies() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let core = zip_source(&lib, "Core", &[], &[("core.txt", "c")]);
        let app = zip_source(&lib, "App", &["Core"], &[("app.txt", "a")]);
        let tool = zip_source(&lib, "Tool", &["Core"], &[("tool.txt", "t")]);
        lib.refresh().unwrap();
        install(&mut lib, core);
        install(&mut lib, app);

        let plan = lib.prepare_cleaning(&[app]);
        assert_eq!(plan.restores, vec![app, core]);
        assert_eq!(plan.extra_depends, vec![core]);

        install(&mut lib, tool);
        let plan = lib.prepare_cleaning(&[app]);
        assert_eq!(plan.restores, vec![app]);
        assert!(plan.extra_depends.is_empty());
    }

    #[test]
    fn test_broken_depend_follows_first_dependency_only() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let core = zip_source(&lib, "Core", &[], &[("core.txt", "c")]);
        let extra = zip_source(&lib, "Extra", &[], &[("extra.txt", "e")]);
        let app = zip_source(&lib, "App", &["Core", "Extra"], &[("app.txt", "a")]);
        lib.refresh().unwrap();
        install(&mut lib, core);
        install(&mut lib, app);
        assert!(!lib.find_by_hash(app).unwrap().status.broken_depend);
        assert!(lib.find_by_hash(extra).is_some());

        let mut go = keep_going();
        assert_eq!(lib.uninstall_mod(core, &mut go), OpResult::Ok);
        assert!(lib.find_by_hash(app).unwrap().status.broken_depend);
        assert!(!lib.find_by_hash(app).unwrap().status.missing_depend);
    }

    #[test]
    fn test_install_failure_rolls_back() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let target = lib.config().target_dir.clone();
        write_tree(&target, &[("a.txt", "old a"), ("d.txt", "old d"), ("e.txt", "old e")]);
        let before = snapshot(&target);
        let hash = dir_source(
            &lib,
            "ModC",
            &[("a.txt", "1"), ("b.txt", "2"), ("c.txt", "3"), ("d.txt", "4"), ("e.txt", "5")],
        );
        lib.refresh().unwrap();
        fs::remove_file(lib.config().library_dir.join("ModC/d.txt")).unwrap();

        let mut go = keep_going();
        assert_eq!(lib.install_mod(hash, &mut go), OpResult::Error);
        let pkg = lib.find_by_hash(hash).unwrap();
        assert!(!pkg.has_backup());
        assert_eq!(pkg.progress(), 0);
        assert!(lib.last_error(hash).contains("d.txt"));
        assert_eq!(snapshot(&target), before);
    }

    #[test]
    fn test_supersede_replaces_installed_version() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let old = dir_source(&lib, "Pack_v1.0", &[("p.txt", "one")]);
        lib.refresh().unwrap();
        install(&mut lib, old);
        let new = dir_source(&lib, "Pack_v2.0", &[("p.txt", "two")]);
        lib.refresh().unwrap();
        assert_eq!(lib.supersede_targets(new), vec![old]);

        let mut go = keep_going();
        assert_eq!(lib.supersede_mod(new, &mut go), OpResult::Ok);
        assert!(lib.find_by_hash(old).is_none());
        assert!(!lib.config().library_dir.join("Pack_v1.0").exists());
        assert!(lib.find_by_hash(new).unwrap().is_installed());
        let target = lib.config().target_dir.join("p.txt");
        assert_eq!(fs::read_to_string(target).unwrap(), "two");
    }

    #[test]
    fn test_install_of_installed_mod_is_refused_untouched() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let hash = dir_source(&lib, "Solo", &[("s.txt", "mine")]);
        lib.refresh().unwrap();
        install(&mut lib, hash);

        let mut go = keep_going();
        assert_eq!(lib.install_mod(hash, &mut go), OpResult::Abort);
        assert!(lib.find_by_hash(hash).unwrap().is_installed());
        assert!(lib.last_error(hash).contains("already has a backup"));
        let target = lib.config().target_dir.join("s.txt");
        assert_eq!(fs::read_to_string(target).unwrap(), "mine");
    }

    #[test]
    fn test_supersede_keeps_new_version_already_installed() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        let old = dir_source(&lib, "Pack_v1.0", &[("one.txt", "1")]);
        let new = dir_source(&lib, "Pack_v2.0", &[("two.txt", "2")]);
        lib.refresh().unwrap();
        install(&mut lib, old);
        install(&mut lib, new);

        let mut go = keep_going();
        assert_eq!(lib.supersede_mod(new, &mut go), OpResult::Ok);
        assert!(lib.find_by_hash(old).is_none());
        assert!(lib.find_by_hash(new).unwrap().is_installed());
        let target = lib.config().target_dir.clone();
        assert!(!target.join("one.txt").exists());
        assert_eq!(fs::read_to_string(target.join("two.txt")).unwrap(), "2");
    }

    #[test]
    fn test_sort_modpacks_by_key() {
        let temp = TempDir::new().unwrap();
        let mut lib = library_in(&temp, false);
        dir_source(&lib, "beta", &[("b.txt", "b")]);
        let alpha = dir_source(&lib, "Alpha", &[("a.txt", "a")]);
        dir_source(&lib, "Gamma_v2", &[("g.txt", "g")]);
        lib.refresh().unwrap();
        install(&mut lib, alpha);

        lib.sort_modpacks(ModSortKey::Name, true);
        let names: Vec<&str> = lib.modpacks().iter().map(|p| p.identity.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "Gamma_v2"]);
        lib.sort_modpacks(ModSortKey::Name, false);
        assert_eq!(lib.modpacks()[0].identity, "Gamma_v2");
        lib.sort_modpacks(ModSortKey::Version, false);
        assert_eq!(lib.modpacks()[0].identity, "Gamma_v2");
        lib.sort_modpacks(ModSortKey::Installed, true);
        assert_eq!(lib.modpacks()[0].identity, "Alpha");
    }
}
