//! Declaration discovery, indexing and persistence.
//!
//! Every registered folder is parsed on a background thread, one task per
//! default type. Results are published as immutable per-type snapshots, so a
//! reader sees either the old or the new set and never a mixture. Queries block
//! until all running parse tasks have finished, except when called from a parse
//! worker itself (signal handlers run there).

use std::cell::Cell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};

use super::block::parse_blocks;
use super::save::{format_declaration, save_in_place};
use super::{DeclError, DeclType, Declaration, DeclarationBlockSyntax, DeclarationCreator, decl_key};
use crate::module::{ModuleContext, ModuleError, RegisterableModule};
use crate::signal::Signal;
use crate::vfs::{FileInfo, MODULE_VIRTUALFILESYSTEM, VirtualFileSystem};

pub const MODULE_DECLMANAGER: &str = "DeclarationManager";

/// File stem used when saving declarations that have no source file yet.
const GENERATED_FILE_STEM: &str = "editor_generated";

/// Declarations of one type keyed by lower-cased name.
pub type NamedDeclarations = BTreeMap<String, Arc<dyn Declaration>>;

thread_local! {
    static IN_PARSER_WORKER: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone)]
struct RegisteredFolder {
    default_type: DeclType,
    folder: String,
    extension: String,
}

#[derive(Debug, Clone)]
struct UnrecognisedBlock {
    origin: DeclType,
    block: DeclarationBlockSyntax,
}

/// Completion token of one background parse.
struct ParseTask {
    complete: Mutex<bool>,
    finished: Condvar,
    cancelled: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ParseTask {
    fn new() -> Self {
        Self {
            complete: Mutex::new(false),
            finished: Condvar::new(),
            cancelled: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    fn wait(&self) {
        let mut complete = self.complete.lock();
        while !*complete {
            self.finished.wait(&mut complete);
        }
    }

    fn mark_complete(&self) {
        *self.complete.lock() = true;
        self.finished.notify_all();
    }

    fn is_complete(&self) -> bool {
        *self.complete.lock()
    }

    fn check_cancelled(&self) -> Result<(), DeclError> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(DeclError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct DeclarationManager {
    vfs: Arc<VirtualFileSystem>,
    creators: RwLock<BTreeMap<String, Arc<dyn DeclarationCreator>>>,
    keywords: RwLock<HashMap<DeclType, String>>,
    folders: RwLock<Vec<RegisteredFolder>>,
    declarations: RwLock<HashMap<DeclType, Arc<NamedDeclarations>>>,
    unrecognised: Mutex<Vec<UnrecognisedBlock>>,
    tasks: Mutex<HashMap<DeclType, Arc<ParseTask>>>,
    reloaded_signals: Mutex<HashMap<DeclType, Arc<Signal<()>>>>,
    publish_lock: Mutex<()>,
    weak_self: Weak<Self>,
}

impl DeclarationManager {
    pub fn new(vfs: Arc<VirtualFileSystem>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            vfs,
            creators: RwLock::new(BTreeMap::new()),
            keywords: RwLock::new(HashMap::new()),
            folders: RwLock::new(Vec::new()),
            declarations: RwLock::new(HashMap::new()),
            unrecognised: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            reloaded_signals: Mutex::new(HashMap::new()),
            publish_lock: Mutex::new(()),
            weak_self: weak_self.clone(),
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Binds a block keyword to a creator. Retained blocks using the keyword are parsed now.
    pub fn register_decl_type(&self, keyword: &str, creator: Arc<dyn DeclarationCreator>) {
        let key = keyword.to_ascii_lowercase();
        {
            let mut creators = self.creators.write();
            if creators.contains_key(&key) {
                tracing::warn!("[declmgr] Type keyword {} is already registered", keyword);
                return;
            }
            self.keywords
                .write()
                .entry(creator.decl_type())
                .or_insert_with(|| keyword.to_string());
            creators.insert(key.clone(), creator);
        }
        tracing::debug!("[declmgr] Registered type keyword {}", keyword);

        self.handle_unrecognised_blocks(&key);
    }

    pub fn unregister_decl_type(&self, keyword: &str) {
        let key = keyword.to_ascii_lowercase();
        let removed = self.creators.write().remove(&key);
        if let Some(creator) = removed {
            let mut keywords = self.keywords.write();
            if keywords.get(&creator.decl_type()).is_some_and(|k| k.eq_ignore_ascii_case(keyword)) {
                keywords.remove(&creator.decl_type());
            }
        } else {
            tracing::warn!("[declmgr] Cannot unregister unknown type keyword {}", keyword);
        }
    }

    /// Registers a folder whose blocks default to `default_type` and starts parsing it.
    pub fn register_decl_folder(&self, default_type: DeclType, folder: &str, extension: &str) {
        let folder = if folder.ends_with('/') {
            folder.to_string()
        } else {
            format!("{folder}/")
        };
        let extension = extension.trim_start_matches('.').to_string();
        tracing::info!("[declmgr] Registered folder {}*.{} for {}", folder, extension, default_type);

        self.folders.write().push(RegisteredFolder {
            default_type,
            folder,
            extension,
        });
        self.start_parse_task(default_type, false);
    }

    /// Emitted (on the parse thread) after the snapshot of the type was replaced.
    pub fn signal_decls_reloaded(&self, decl_type: DeclType) -> Arc<Signal<()>> {
        self.reloaded_signals.lock().entry(decl_type).or_default().clone()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn find_declaration(&self, decl_type: DeclType, name: &str) -> Option<Arc<dyn Declaration>> {
        self.wait_for_parsers();
        self.snapshot(decl_type).get(&decl_key(name)).cloned()
    }

    pub fn foreach_declaration(&self, decl_type: DeclType, mut visitor: impl FnMut(&Arc<dyn Declaration>)) {
        self.wait_for_parsers();
        let snapshot = self.snapshot(decl_type);
        for decl in snapshot.values() {
            visitor(decl);
        }
    }

    pub fn declaration_count(&self, decl_type: DeclType) -> usize {
        self.wait_for_parsers();
        self.snapshot(decl_type).len()
    }

    /// Returns the existing declaration or creates an empty, modified, unsourced one.
    pub fn find_or_create_declaration(&self, decl_type: DeclType, name: &str) -> Option<Arc<dyn Declaration>> {
        if let Some(existing) = self.find_declaration(decl_type, name) {
            return Some(existing);
        }

        let Some(creator) = self.creator_for_type(decl_type) else {
            tracing::warn!("[declmgr] No creator registered for type {}", decl_type);
            return None;
        };

        let decl = creator.create_declaration(name);
        decl.set_block_syntax(DeclarationBlockSyntax::new(&self.keyword_for_type(decl_type), name, ""));
        decl.set_modified(true);

        if self.insert_declaration(decl.clone()) {
            Some(decl)
        } else {
            self.find_declaration(decl_type, name)
        }
    }

    /// Adds a declaration to its type's snapshot. Fails if the name is taken.
    pub fn insert_declaration(&self, decl: Arc<dyn Declaration>) -> bool {
        let _guard = self.publish_lock.lock();
        let mut declarations = self.declarations.write();
        let map = Arc::make_mut(declarations.entry(decl.decl_type()).or_default());

        match map.entry(decl_key(&decl.decl_name())) {
            Entry::Vacant(entry) => {
                entry.insert(decl);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn remove_declaration(&self, decl_type: DeclType, name: &str) -> bool {
        self.wait_for_parsers();
        let _guard = self.publish_lock.lock();
        let mut declarations = self.declarations.write();

        let removed = declarations
            .get_mut(&decl_type)
            .and_then(|map| Arc::make_mut(map).remove(&decl_key(name)));
        if removed.is_none() {
            tracing::warn!("[declmgr] Cannot remove unknown {} {}", decl_type, name);
        }
        removed.is_some()
    }

    /// Renames a declaration. Fails if `old_name` is missing or `new_name` is taken.
    pub fn rename_declaration(&self, decl_type: DeclType, old_name: &str, new_name: &str) -> bool {
        self.wait_for_parsers();
        let _guard = self.publish_lock.lock();
        let mut declarations = self.declarations.write();

        let Some(map) = declarations.get_mut(&decl_type) else {
            tracing::warn!("[declmgr] Cannot rename unknown {} {}", decl_type, old_name);
            return false;
        };

        let old_key = decl_key(old_name);
        let new_key = decl_key(new_name);

        if !map.contains_key(&old_key) {
            tracing::warn!("[declmgr] Cannot rename unknown {} {}", decl_type, old_name);
            return false;
        }
        if old_key != new_key && map.contains_key(&new_key) {
            tracing::warn!("[declmgr] Cannot rename {} to {}: name already in use", old_name, new_name);
            return false;
        }

        let map = Arc::make_mut(map);
        let Some(decl) = map.remove(&old_key) else {
            return false;
        };
        decl.set_decl_name(new_name);
        map.insert(new_key, decl);
        true
    }

    /// Returns `name` if unused, else `name` with the first free two-digit suffix.
    pub fn ensure_non_conflicting_name(&self, decl_type: DeclType, name: &str) -> String {
        self.wait_for_parsers();
        let snapshot = self.snapshot(decl_type);

        let mut candidate = name.to_string();
        let mut index = 0;
        while snapshot.contains_key(&decl_key(&candidate)) {
            index += 1;
            candidate = format!("{name}{index:02}");
        }
        candidate
    }

    /// Keyword written in front of new declarations of this type.
    pub fn keyword_for_type(&self, decl_type: DeclType) -> String {
        self.keywords
            .read()
            .get(&decl_type)
            .cloned()
            .unwrap_or_else(|| decl_type.name().to_string())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Writes the declaration's canonical text into its file, keeping every other block.
    pub fn save_declaration(&self, decl: &Arc<dyn Declaration>) -> Result<(), DeclError> {
        self.wait_for_parsers();

        let block = decl.block_syntax();
        let decl_type = decl.decl_type();

        let (relative, physical) = match &block.file_info {
            Some(info) => (info.full_path(), info.physical_path.clone().filter(|_| info.is_physical)),
            None => {
                let Some(folder) = self.folder_for_type(decl_type) else {
                    return Err(DeclError::NoWritablePath(block.name.clone()));
                };
                (format!("{}{GENERATED_FILE_STEM}.{}", folder.folder, folder.extension), None)
            }
        };

        let target = match physical {
            Some(path) => path,
            None => {
                let Some(root) = self.vfs.writable_root() else {
                    return Err(DeclError::NoWritablePath(block.name.clone()));
                };
                root.join(&relative)
            }
        };

        let inherited = if target.exists() {
            None
        } else {
            self.vfs.open_text_file(&relative).map(|file| file.contents)
        };

        let text = format_declaration(&block.type_name, &block.name, &decl.generate_syntax());
        save_in_place(&target, inherited.as_deref(), &block.type_name, &block.name, &text)?;

        let (top_dir, name) = match relative.rfind('/') {
            Some(pos) => (relative[..=pos].to_string(), relative[pos + 1..].to_string()),
            None => (String::new(), relative.clone()),
        };
        decl.set_file_info(Some(FileInfo {
            top_dir,
            name,
            is_physical: true,
            archive: self.vfs.writable_root().map(|p| p.display().to_string()).unwrap_or_default(),
            physical_path: Some(target.clone()),
        }));
        decl.set_modified(false);

        tracing::info!("[declmgr] Saved {} {} to {}", decl_type, block.name, target.display());
        Ok(())
    }

    /// Re-parses every registered folder and blocks until done.
    pub fn reload_declarations(&self) {
        tracing::info!("[declmgr] Reloading declarations");
        let types: BTreeSet<DeclType> = self.folders.read().iter().map(|f| f.default_type).collect();
        for decl_type in types {
            self.start_parse_task(decl_type, true);
        }
        self.wait_for_parsers();
    }

    /// Cancels running parse tasks and drops every declaration.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.cancelled.store(true, Ordering::Release);
        }
        for task in tasks {
            let handle = task.handle.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("[declmgr] Parser thread panicked");
                }
            }
        }
        self.declarations.write().clear();
        self.unrecognised.lock().clear();
        self.folders.write().clear();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn snapshot(&self, decl_type: DeclType) -> Arc<NamedDeclarations> {
        self.declarations.read().get(&decl_type).cloned().unwrap_or_default()
    }

    fn creator_for_type(&self, decl_type: DeclType) -> Option<Arc<dyn DeclarationCreator>> {
        let keyword = self.keywords.read().get(&decl_type).cloned()?;
        self.creators.read().get(&keyword.to_ascii_lowercase()).cloned()
    }

    fn folder_for_type(&self, decl_type: DeclType) -> Option<RegisteredFolder> {
        self.folders.read().iter().find(|f| f.default_type == decl_type).cloned()
    }

    /// Blocks until every running parse task is complete. No-op on parse workers.
    fn wait_for_parsers(&self) {
        if IN_PARSER_WORKER.with(Cell::get) {
            return;
        }
        let tasks: Vec<_> = self.tasks.lock().values().cloned().collect();
        for task in tasks {
            task.wait();
        }
        self.tasks.lock().retain(|_, task| !task.is_complete());
    }

    fn start_parse_task(&self, default_type: DeclType, drop_unsourced: bool) {
        let running = self.tasks.lock().get(&default_type).cloned();
        if let Some(task) = running {
            if !IN_PARSER_WORKER.with(Cell::get) {
                task.wait();
            }
        }

        let task = Arc::new(ParseTask::new());
        self.tasks.lock().insert(default_type, task.clone());

        let weak = self.weak_self.clone();
        let worker_task = task.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("declparser-{default_type}"))
            .spawn(move || {
                IN_PARSER_WORKER.with(|flag| flag.set(true));
                if let Some(manager) = weak.upgrade() {
                    manager.run_parse_task(default_type, &worker_task, drop_unsourced);
                }
                worker_task.mark_complete();
            });

        match spawned {
            Ok(handle) => *task.handle.lock() = Some(handle),
            Err(e) => {
                tracing::error!("[declmgr] Failed to spawn parser thread: {}", e);
                task.mark_complete();
            }
        }
    }

    fn run_parse_task(&self, default_type: DeclType, task: &ParseTask, drop_unsourced: bool) {
        match self.parse_folders(default_type, task) {
            Ok((parsed, unrecognised)) => self.publish(default_type, parsed, unrecognised, drop_unsourced),
            Err(DeclError::Cancelled) => {
                tracing::debug!("[declmgr] Parsing of {} was cancelled", default_type);
                self.discard(default_type);
            }
            Err(e) => tracing::error!("[declmgr] Parsing of {} failed: {}", default_type, e),
        }
    }

    #[allow(clippy::type_complexity)]
    fn parse_folders(
        &self,
        default_type: DeclType,
        task: &ParseTask,
    ) -> Result<(HashMap<DeclType, NamedDeclarations>, Vec<UnrecognisedBlock>), DeclError> {
        let folders: Vec<_> = self
            .folders
            .read()
            .iter()
            .filter(|f| f.default_type == default_type)
            .cloned()
            .collect();

        let mut blocks = Vec::new();
        let mut file_count = 0;
        for folder in &folders {
            self.vfs.for_each_file(&folder.folder, &folder.extension, 0, |info| {
                let Some(file) = self.vfs.open_text_file(&info.full_path()) else {
                    tracing::warn!("[declmgr] Could not open {}", info.full_path());
                    return;
                };
                file_count += 1;
                blocks.extend(parse_blocks(&file.contents, Some(info)));
            });
        }

        let creators = self.creators.read().clone();
        let default_creator = self
            .keywords
            .read()
            .get(&default_type)
            .and_then(|k| creators.get(&k.to_ascii_lowercase()).cloned());

        let mut parsed: HashMap<DeclType, NamedDeclarations> = HashMap::new();
        let mut unrecognised = Vec::new();

        for block in blocks {
            task.check_cancelled()?;

            let creator = if block.type_name.is_empty() {
                default_creator.clone()
            } else {
                creators.get(&block.type_name.to_ascii_lowercase()).cloned()
            };

            let Some(creator) = creator else {
                unrecognised.push(UnrecognisedBlock {
                    origin: default_type,
                    block,
                });
                continue;
            };

            let decl = create_from_block(creator.as_ref(), block, default_type);
            insert_first_wins(parsed.entry(creator.decl_type()).or_default(), decl);
        }

        tracing::debug!("[declmgr] Parsed {} files for {}", file_count, default_type);
        Ok((parsed, unrecognised))
    }

    /// Installs parse results for one default type and notifies listeners.
    fn publish(
        &self,
        origin: DeclType,
        mut parsed: HashMap<DeclType, NamedDeclarations>,
        unrecognised: Vec<UnrecognisedBlock>,
        drop_unsourced: bool,
    ) {
        let guard = self.publish_lock.lock();

        // Keywords registered while the task was running.
        let creators = self.creators.read().clone();
        let mut retained = Vec::new();
        for item in unrecognised {
            match creators.get(&item.block.type_name.to_ascii_lowercase()) {
                Some(creator) => {
                    let decl = create_from_block(creator.as_ref(), item.block, origin);
                    insert_first_wins(parsed.entry(creator.decl_type()).or_default(), decl);
                }
                None => retained.push(item),
            }
        }
        if !retained.is_empty() {
            tracing::debug!("[declmgr] Retaining {} unrecognised blocks from {} folders", retained.len(), origin);
        }
        {
            let mut list = self.unrecognised.lock();
            list.retain(|item| item.origin != origin);
            list.extend(retained);
        }

        let replaced_by_reload = |decl: &Arc<dyn Declaration>| {
            decl.origin() == Some(origin) || (drop_unsourced && decl.origin().is_none())
        };

        let mut affected = Vec::new();
        {
            let mut declarations = self.declarations.write();
            let types: BTreeSet<DeclType> = declarations.keys().chain(parsed.keys()).copied().collect();

            for decl_type in types {
                let old = declarations.get(&decl_type).cloned().unwrap_or_default();
                let fresh = parsed.remove(&decl_type).unwrap_or_default();

                if fresh.is_empty() && !old.values().any(replaced_by_reload) {
                    continue;
                }

                let mut snapshot: NamedDeclarations = old
                    .iter()
                    .filter(|(_, decl)| !replaced_by_reload(*decl))
                    .map(|(key, decl)| (key.clone(), decl.clone()))
                    .collect();
                for decl in fresh.into_values() {
                    insert_first_wins(&mut snapshot, decl);
                }

                affected.push((decl_type, snapshot.len()));
                declarations.insert(decl_type, Arc::new(snapshot));
            }
        }
        drop(guard);

        for (decl_type, count) in affected {
            tracing::info!("[declmgr] Found {} declarations of type {}", count, decl_type);
            self.signal_decls_reloaded(decl_type).emit(&());
        }
    }

    /// Drops everything a cancelled task of `origin` would have replaced, silently.
    fn discard(&self, origin: DeclType) {
        let _guard = self.publish_lock.lock();
        let mut declarations = self.declarations.write();
        for map in declarations.values_mut() {
            if map.values().any(|d| d.origin() == Some(origin)) {
                Arc::make_mut(map).retain(|_, d| d.origin() != Some(origin));
            }
        }
    }

    fn handle_unrecognised_blocks(&self, keyword: &str) {
        let guard = self.publish_lock.lock();

        let Some(creator) = self.creators.read().get(keyword).cloned() else {
            return;
        };

        let matching: Vec<UnrecognisedBlock> = {
            let mut list = self.unrecognised.lock();
            let (matching, rest): (Vec<_>, Vec<_>) = list
                .drain(..)
                .partition(|item| item.block.type_name.eq_ignore_ascii_case(keyword));
            *list = rest;
            matching
        };

        if matching.is_empty() {
            return;
        }

        let decl_type = creator.decl_type();
        {
            let mut declarations = self.declarations.write();
            let map = Arc::make_mut(declarations.entry(decl_type).or_default());
            for item in matching {
                let decl = create_from_block(creator.as_ref(), item.block, item.origin);
                insert_first_wins(map, decl);
            }
        }
        drop(guard);

        tracing::info!("[declmgr] Parsed retained blocks for keyword {}", keyword);
        self.signal_decls_reloaded(decl_type).emit(&());
    }
}

fn create_from_block(creator: &dyn DeclarationCreator, block: DeclarationBlockSyntax, origin: DeclType) -> Arc<dyn Declaration> {
    let decl = creator.create_declaration(&block.name);
    decl.set_block_syntax(block);
    decl.set_origin(Some(origin));
    decl
}

fn insert_first_wins(map: &mut NamedDeclarations, decl: Arc<dyn Declaration>) {
    match map.entry(decl_key(&decl.decl_name())) {
        Entry::Vacant(entry) => {
            entry.insert(decl);
        }
        Entry::Occupied(existing) => {
            let location = |d: &Arc<dyn Declaration>| d.file_info().map(|f| f.full_path()).unwrap_or_default();
            tracing::warn!(
                "[declmgr] {} {} in {} has already been declared in {}",
                decl.decl_type(),
                decl.decl_name(),
                location(&decl),
                location(existing.get())
            );
        }
    }
}

impl RegisterableModule for DeclarationManager {
    fn name(&self) -> &'static str {
        MODULE_DECLMANAGER
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![MODULE_VIRTUALFILESYSTEM]
    }

    fn initialise_module(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    fn shutdown_module(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{FnCreator, RawDeclaration};
    use crate::vfs::MemoryArchive;
    use std::sync::atomic::AtomicUsize;

    fn raw_creator(decl_type: DeclType) -> Arc<dyn DeclarationCreator> {
        Arc::new(FnCreator::new(decl_type, move |name: &str| {
            Arc::new(RawDeclaration::new(decl_type, name)) as Arc<dyn Declaration>
        }))
    }

    fn setup_manager(files: &[(&str, &str)]) -> Arc<DeclarationManager> {
        let vfs = Arc::new(VirtualFileSystem::new());
        let mut archive = MemoryArchive::new("base");
        for (path, contents) in files {
            archive = archive.with_file(path, contents);
        }
        vfs.add_archive(Arc::new(archive));
        DeclarationManager::new(vfs)
    }

    #[test]
    fn test_find_blocks_until_parsed() {
        let manager = setup_manager(&[
            ("skins/a.skin", "skin one { a b }\nskin two { c d }"),
            ("skins/b.skin", "skin One { duplicate }"),
        ]);
        manager.register_decl_type("skin", raw_creator(DeclType::Skin));
        manager.register_decl_folder(DeclType::Skin, "skins", ".skin");

        let one = manager.find_declaration(DeclType::Skin, "ONE").unwrap();
        assert_eq!(one.block_syntax().contents, " a b ");
        assert_eq!(one.file_info().unwrap().full_path(), "skins/a.skin");
        assert_eq!(manager.declaration_count(DeclType::Skin), 2);
        assert!(manager.find_declaration(DeclType::Skin, "three").is_none());
    }

    #[test]
    fn test_default_type_for_untyped_blocks() {
        let manager = setup_manager(&[("materials/x.mtr", "textures/a { }\ntable t { { 1 } }")]);
        manager.register_decl_type("material", raw_creator(DeclType::Material));
        manager.register_decl_type("table", raw_creator(DeclType::Table));
        manager.register_decl_folder(DeclType::Material, "materials", "mtr");

        assert!(manager.find_declaration(DeclType::Material, "textures/a").is_some());
        let table = manager.find_declaration(DeclType::Table, "t").unwrap();
        assert_eq!(table.origin(), Some(DeclType::Material));
    }

    #[test]
    fn test_unrecognised_blocks_are_reoffered() {
        let manager = setup_manager(&[("particles/p.prt", "particle smoke { }\nfxthing late { }")]);
        manager.register_decl_type("particle", raw_creator(DeclType::Particle));
        manager.register_decl_folder(DeclType::Particle, "particles", "prt");
        assert_eq!(manager.declaration_count(DeclType::Particle), 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        manager.signal_decls_reloaded(DeclType::Skin).connect(move |()| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        manager.register_decl_type("fxthing", raw_creator(DeclType::Skin));
        assert!(manager.find_declaration(DeclType::Skin, "late").is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_signal_fires_after_install() {
        let manager = setup_manager(&[("def/a.def", "entityDef light { }")]);
        manager.register_decl_type("entityDef", raw_creator(DeclType::EntityDef));

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let weak = Arc::downgrade(&manager);
        manager.signal_decls_reloaded(DeclType::EntityDef).connect(move |()| {
            // Runs on the parse worker: the query must not block and must see the new snapshot.
            if let Some(manager) = weak.upgrade() {
                s.store(manager.declaration_count(DeclType::EntityDef), Ordering::SeqCst);
            }
        });

        manager.register_decl_folder(DeclType::EntityDef, "def", "def");
        assert_eq!(manager.declaration_count(DeclType::EntityDef), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        manager.find_or_create_declaration(DeclType::EntityDef, "user_made").unwrap();
        assert_eq!(manager.declaration_count(DeclType::EntityDef), 2);

        manager.reload_declarations();
        assert_eq!(manager.declaration_count(DeclType::EntityDef), 1);
    }

    #[test]
    fn test_find_or_create_and_conflicting_names() {
        let manager = setup_manager(&[("materials/x.mtr", "a { }\na01 { }")]);
        manager.register_decl_type("material", raw_creator(DeclType::Material));
        manager.register_decl_folder(DeclType::Material, "materials", "mtr");

        assert_eq!(manager.ensure_non_conflicting_name(DeclType::Material, "b"), "b");
        assert_eq!(manager.ensure_non_conflicting_name(DeclType::Material, "a"), "a02");

        let created = manager.find_or_create_declaration(DeclType::Material, "a02").unwrap();
        assert!(created.is_modified());
        assert!(created.file_info().is_none());
        assert_eq!(created.block_syntax().type_name, "material");
        assert_eq!(manager.ensure_non_conflicting_name(DeclType::Material, "a"), "a03");

        let existing = manager.find_or_create_declaration(DeclType::Material, "a").unwrap();
        assert!(!existing.is_modified());
    }

    #[test]
    fn test_rename_and_remove() {
        let manager = setup_manager(&[("materials/x.mtr", "a { }\nb { }")]);
        manager.register_decl_type("material", raw_creator(DeclType::Material));
        manager.register_decl_folder(DeclType::Material, "materials", "mtr");

        assert!(!manager.rename_declaration(DeclType::Material, "a", "b"));
        assert!(!manager.rename_declaration(DeclType::Material, "missing", "c"));
        assert!(manager.rename_declaration(DeclType::Material, "a", "c"));
        assert!(manager.find_declaration(DeclType::Material, "a").is_none());
        assert_eq!(manager.find_declaration(DeclType::Material, "c").unwrap().decl_name(), "c");

        assert!(manager.remove_declaration(DeclType::Material, "c"));
        assert!(!manager.remove_declaration(DeclType::Material, "c"));
    }

    #[test]
    fn test_save_unsourced_declaration_to_writable_root() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(&[]);
        manager.vfs.set_writable_root(Some(dir.path().to_path_buf()));
        manager.register_decl_type("material", raw_creator(DeclType::Material));
        manager.register_decl_folder(DeclType::Material, "materials", "mtr");

        let decl = manager.find_or_create_declaration(DeclType::Material, "textures/new").unwrap();
        manager.save_declaration(&decl).unwrap();

        let path = dir.path().join("materials/editor_generated.mtr");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("material textures/new\n{\n}\n"));
        assert!(!decl.is_modified());
        assert_eq!(decl.file_info().unwrap().physical_path, Some(path));
    }

    #[test]
    fn test_save_archive_declaration_inherits_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let manager = setup_manager(&[("materials/x.mtr", "a\n{\n}\nb\n{\n}\n")]);
        manager.vfs.set_writable_root(Some(dir.path().to_path_buf()));
        manager.register_decl_type("material", raw_creator(DeclType::Material));
        manager.register_decl_folder(DeclType::Material, "materials", "mtr");

        let b = manager.find_declaration(DeclType::Material, "b").unwrap();
        b.set_block_contents("\tqer_editorimage x\n".to_string());
        manager.save_declaration(&b).unwrap();

        let text = std::fs::read_to_string(dir.path().join("materials/x.mtr")).unwrap();
        assert_eq!(
            text,
            format!("a\n{{\n}}\n{}\nb\n{{\n\tqer_editorimage x\n}}\n", crate::decl::GENERATED_HEADER)
        );
    }
}
