//! Shared test fixtures: an in-memory filesystem, a scripted channel
//! and recording stand-ins for every injected service.
// (c) 2024 Ross Younger

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, DuplexStream, ReadBuf};

use crate::access::{FilePolicy, Permission, User, VirtualFolder};
use crate::channel::SessionChannel;
use crate::config::ScpConfig;
use crate::error::ScpError;
use crate::services::{
    ConnectionRegistry, DiskQuota, HookOp, PreActionHook, QuotaStore, SessionServices,
    TransferQuota,
};
use crate::transfer::{Transfer, TransferDirection, TransferFactory, TransferParams};
use crate::util::vpath;
use crate::vfs::{
    CancelFn, CreateOptions, DirLister, FileHandle, FileKind, FileStat, Fs,
};

pub(crate) const TEST_MTIME: i64 = 1_700_000_000;

pub(crate) fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

// ---------------------------------------------------------------- channel

/// Everything the engine did at the SSH channel level.
#[derive(Default)]
pub(crate) struct ChannelLog {
    exit_statuses: Mutex<Vec<u32>>,
    closes: AtomicUsize,
}

impl ChannelLog {
    pub fn exit_statuses(&self) -> Vec<u32> {
        self.exit_statuses.lock().unwrap().clone()
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// One half of a duplex pipe wearing the [`SessionChannel`] hat.
pub(crate) struct TestChannel {
    inner: DuplexStream,
    log: Arc<ChannelLog>,
}

impl TestChannel {
    /// Returns (peer end, engine end).
    pub fn pair() -> (DuplexStream, TestChannel) {
        Self::pair_with_log(Arc::new(ChannelLog::default()))
    }

    pub fn pair_with_log(log: Arc<ChannelLog>) -> (DuplexStream, TestChannel) {
        let (peer, inner) = tokio::io::duplex(1 << 20);
        (peer, TestChannel { inner, log })
    }
}

impl AsyncRead for TestChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl SessionChannel for TestChannel {
    async fn send_exit_status(&mut self, status: u32) -> io::Result<()> {
        self.log.exit_statuses.lock().unwrap().push(status);
        Ok(())
    }
    async fn close(&mut self) -> io::Result<()> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.shutdown().await
    }
}

// ------------------------------------------------------------- filesystem

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir,
    Symlink { target: String },
}

type Nodes = Arc<Mutex<BTreeMap<String, Node>>>;

/// An in-memory [`Fs`] backend. Keys are canonical virtual paths; the
/// "resolved" form is simply the same path, which keeps assertions
/// readable.
pub(crate) struct MemFs {
    nodes: Nodes,
    owners: Mutex<Vec<(String, u32, u32)>>,
    pub atomic_supported: bool,
    pub truncate_supported: bool,
    pub resume_supported: bool,
}

impl MemFs {
    pub fn new() -> Self {
        let mut map = BTreeMap::new();
        map.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Arc::new(Mutex::new(map)),
            owners: Mutex::new(Vec::new()),
            atomic_supported: false,
            truncate_supported: true,
            resume_supported: false,
        }
    }

    fn key(path: &Path) -> String {
        vpath::clean(&path.to_string_lossy())
    }

    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let mut cur = String::new();
        for seg in vpath::clean(path).split('/').filter(|s| !s.is_empty()) {
            cur = format!("{cur}/{seg}");
            nodes.insert(cur.clone(), Node::Dir);
        }
    }

    pub fn add_file(&self, path: &str, data: &[u8], mode: u32) {
        let clean = vpath::clean(path);
        self.add_dir(&vpath::parent(&clean));
        self.nodes.lock().unwrap().insert(
            clean,
            Node::File {
                data: data.to_vec(),
                mode,
            },
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.nodes.lock().unwrap().insert(
            vpath::clean(path),
            Node::Symlink {
                target: vpath::clean(target),
            },
        );
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(&vpath::clean(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .contains_key(&vpath::clean(path))
    }

    pub fn owners(&self) -> Vec<(String, u32, u32)> {
        self.owners.lock().unwrap().clone()
    }

    fn stat_of(nodes: &BTreeMap<String, Node>, key: &str, follow: bool) -> io::Result<FileStat> {
        let node = nodes
            .get(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        let (kind, size, mode) = match node {
            Node::Dir => (FileKind::Dir, 0, 0o755),
            Node::File { data, mode } => (FileKind::File, data.len() as u64, *mode),
            Node::Symlink { target } => {
                if follow {
                    return Self::stat_of(nodes, target, true);
                }
                (FileKind::Symlink, 0, 0o777)
            }
        };
        Ok(FileStat {
            name: vpath::base(key),
            kind,
            size,
            mode,
            modified: TEST_MTIME,
        })
    }

    /// Follows a symlink to its file key, if needed.
    fn file_key(nodes: &BTreeMap<String, Node>, key: &str) -> io::Result<String> {
        match nodes.get(key) {
            Some(Node::Symlink { target }) => Self::file_key(nodes, target),
            Some(_) => Ok(key.to_string()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }
}

#[async_trait]
impl Fs for MemFs {
    fn resolve_path(&self, virtual_path: &str) -> io::Result<PathBuf> {
        Ok(PathBuf::from(vpath::clean(virtual_path)))
    }
    fn get_relative_path(&self, resolved: &Path) -> String {
        Self::key(resolved)
    }
    fn join(&self, resolved: &Path, name: &str) -> PathBuf {
        PathBuf::from(vpath::join(&Self::key(resolved), name))
    }
    fn atomic_upload_path(&self, resolved: &Path) -> PathBuf {
        PathBuf::from(format!("{}.upload-tmp", Self::key(resolved)))
    }
    fn is_atomic_upload_supported(&self) -> bool {
        self.atomic_supported
    }
    fn is_upload_resume_supported(&self) -> bool {
        self.resume_supported
    }
    fn has_truncate_support(&self) -> bool {
        self.truncate_supported
    }

    async fn stat(&self, resolved: &Path) -> io::Result<FileStat> {
        let nodes = self.nodes.lock().unwrap();
        Self::stat_of(&nodes, &Self::key(resolved), true)
    }
    async fn lstat(&self, resolved: &Path) -> io::Result<FileStat> {
        let nodes = self.nodes.lock().unwrap();
        Self::stat_of(&nodes, &Self::key(resolved), false)
    }
    async fn mkdir(&self, resolved: &Path) -> io::Result<()> {
        let key = Self::key(resolved);
        let mut nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(&vpath::parent(&key)), Some(Node::Dir)) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "parent directory does not exist",
            ));
        }
        nodes.insert(key, Node::Dir);
        Ok(())
    }
    async fn create(
        &self,
        resolved: &Path,
        _opts: CreateOptions,
    ) -> io::Result<(Box<dyn FileHandle>, Option<CancelFn>)> {
        let key = Self::key(resolved);
        let mut nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(&vpath::parent(&key)), Some(Node::Dir)) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "parent directory does not exist",
            ));
        }
        nodes.insert(
            key.clone(),
            Node::File {
                data: Vec::new(),
                mode: 0o644,
            },
        );
        drop(nodes);
        let handle = Box::new(MemHandle {
            nodes: Arc::clone(&self.nodes),
            key: key.clone(),
        });
        let nodes = Arc::clone(&self.nodes);
        let cancel: CancelFn = Box::new(move || {
            let _ = nodes.lock().unwrap().remove(&key);
        });
        Ok((handle, Some(cancel)))
    }
    async fn open(
        &self,
        resolved: &Path,
        _offset: u64,
    ) -> io::Result<(Box<dyn FileHandle>, Option<CancelFn>)> {
        let key = {
            let nodes = self.nodes.lock().unwrap();
            MemFs::file_key(&nodes, &Self::key(resolved))?
        };
        Ok((
            Box::new(MemHandle {
                nodes: Arc::clone(&self.nodes),
                key,
            }),
            None,
        ))
    }
    async fn read_dir(&self, resolved: &Path) -> io::Result<Box<dyn DirLister>> {
        let key = Self::key(resolved);
        let nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(&key), Some(Node::Dir)) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        let entries = nodes
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && vpath::parent(k) == key)
            .map(|(k, _)| Self::stat_of(&nodes, k, false).expect("entry exists"))
            .collect();
        Ok(Box::new(MemLister { entries }))
    }
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from = Self::key(from);
        let to = Self::key(to);
        let mut nodes = self.nodes.lock().unwrap();
        let moved: Vec<(String, Node)> = nodes
            .iter()
            .filter(|(k, _)| **k == from || k.starts_with(&format!("{from}/")))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if moved.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        for (k, _) in &moved {
            nodes.remove(k);
        }
        for (k, v) in moved {
            let new_key = format!("{to}{}", &k[from.len()..]);
            nodes.insert(vpath::clean(&new_key), v);
        }
        Ok(())
    }
    async fn set_owner(&self, resolved: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.owners
            .lock()
            .unwrap()
            .push((Self::key(resolved), uid, gid));
        Ok(())
    }
}

struct MemHandle {
    nodes: Nodes,
    key: String,
}

#[async_trait]
impl FileHandle for MemHandle {
    async fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut nodes = self.nodes.lock().unwrap();
        let Some(Node::File { data, .. }) = nodes.get_mut(&self.key) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        };
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let nodes = self.nodes.lock().unwrap();
        let Some(Node::File { data, .. }) = nodes.get(&self.key) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        };
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemLister {
    entries: Vec<FileStat>,
}

#[async_trait]
impl DirLister for MemLister {
    async fn next(&mut self, max: usize) -> io::Result<Vec<FileStat>> {
        let n = max.min(self.entries.len());
        Ok(self.entries.drain(..n).collect())
    }
}

// ------------------------------------------------------------------ user

pub(crate) struct MemUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub fs: Arc<MemFs>,
    denied_perms: Mutex<HashSet<Permission>>,
    denied_patterns: Mutex<Vec<(String, FilePolicy)>>,
    vfolders: Mutex<Vec<VirtualFolder>>,
    hidden_names: Mutex<HashSet<String>>,
}

impl MemUser {
    pub fn new(fs: Arc<MemFs>) -> Self {
        Self {
            name: "tester".into(),
            uid: 1000,
            gid: 1000,
            fs,
            denied_perms: Mutex::new(HashSet::new()),
            denied_patterns: Mutex::new(Vec::new()),
            vfolders: Mutex::new(Vec::new()),
            hidden_names: Mutex::new(HashSet::new()),
        }
    }

    pub fn deny_perm(&self, perm: Permission) {
        self.denied_perms.lock().unwrap().insert(perm);
    }
    pub fn deny_pattern(&self, suffix: &str, policy: FilePolicy) {
        self.denied_patterns
            .lock()
            .unwrap()
            .push((suffix.to_string(), policy));
    }
    pub fn add_vfolder(&self, virtual_path: &str) {
        self.vfolders.lock().unwrap().push(VirtualFolder {
            name: vpath::base(virtual_path),
            virtual_path: virtual_path.to_string(),
        });
    }
    pub fn hide_name(&self, name: &str) {
        self.hidden_names.lock().unwrap().insert(name.to_string());
    }
}

impl User for MemUser {
    fn username(&self) -> &str {
        &self.name
    }
    fn uid(&self) -> u32 {
        self.uid
    }
    fn gid(&self) -> u32 {
        self.gid
    }
    fn has_perm(&self, perm: Permission, _virtual_path: &str) -> bool {
        !self.denied_perms.lock().unwrap().contains(&perm)
    }
    fn is_file_allowed(&self, virtual_path: &str) -> (bool, FilePolicy) {
        for (suffix, policy) in self.denied_patterns.lock().unwrap().iter() {
            if virtual_path.ends_with(suffix.as_str()) {
                return (false, *policy);
            }
        }
        (true, FilePolicy::default())
    }
    fn fs_for_path(&self, _virtual_path: &str) -> io::Result<Arc<dyn Fs>> {
        Ok(Arc::clone(&self.fs) as Arc<dyn Fs>)
    }
    fn virtual_folder_for_path(&self, virtual_path: &str) -> Option<VirtualFolder> {
        self.vfolders
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.virtual_path == virtual_path)
            .cloned()
    }
    fn virtual_folders_info(&self, virtual_path: &str) -> Vec<FileStat> {
        self.vfolders
            .lock()
            .unwrap()
            .iter()
            .filter(|f| vpath::parent(&f.virtual_path) == virtual_path)
            .map(|f| FileStat {
                name: vpath::base(&f.virtual_path),
                kind: FileKind::Dir,
                size: 0,
                mode: 0o755,
                modified: TEST_MTIME,
            })
            .collect()
    }
    fn filter_list_dir(&self, mut entries: Vec<FileStat>, _virtual_dir: &str) -> Vec<FileStat> {
        let hidden = self.hidden_names.lock().unwrap();
        entries.retain(|e| !hidden.contains(&e.name));
        entries
    }
}

// -------------------------------------------------------------- services

#[derive(Default)]
pub(crate) struct RecordingRegistry {
    adds: AtomicUsize,
    removes: AtomicUsize,
    touches: AtomicUsize,
    reject_add: Mutex<Option<String>>,
    reject_transfers: Mutex<Option<String>>,
}

impl RecordingRegistry {
    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }
    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }
    pub fn reject_add(&self, reason: &str) {
        *self.reject_add.lock().unwrap() = Some(reason.to_string());
    }
    pub fn reject_transfers(&self, reason: &str) {
        *self.reject_transfers.lock().unwrap() = Some(reason.to_string());
    }
}

impl ConnectionRegistry for RecordingRegistry {
    fn add(&self, _id: &str, _username: &str) -> Result<(), ScpError> {
        if let Some(reason) = self.reject_add.lock().unwrap().clone() {
            return Err(ScpError::Failure(reason));
        }
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn remove(&self, _id: &str) {
        self.removes.fetch_add(1, Ordering::SeqCst);
    }
    fn is_new_transfer_allowed(&self, _username: &str) -> Result<(), ScpError> {
        if let Some(reason) = self.reject_transfers.lock().unwrap().clone() {
            return Err(ScpError::Failure(reason));
        }
        Ok(())
    }
    fn touch(&self, _id: &str) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct TestQuotaStore {
    pub disk: Mutex<DiskQuota>,
    pub transfer: Mutex<TransferQuota>,
    user_updates: Mutex<Vec<i64>>,
    folder_updates: Mutex<Vec<(String, i64)>>,
}

impl TestQuotaStore {
    pub fn set_disk(&self, quota: DiskQuota) {
        *self.disk.lock().unwrap() = quota;
    }
    pub fn set_transfer(&self, quota: TransferQuota) {
        *self.transfer.lock().unwrap() = quota;
    }
    pub fn user_updates(&self) -> Vec<i64> {
        self.user_updates.lock().unwrap().clone()
    }
    pub fn folder_updates(&self) -> Vec<(String, i64)> {
        self.folder_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl QuotaStore for TestQuotaStore {
    async fn has_space(
        &self,
        _user: &dyn User,
        _is_new_file: bool,
        _is_dir: bool,
        _virtual_path: &str,
    ) -> (DiskQuota, TransferQuota) {
        (
            *self.disk.lock().unwrap(),
            *self.transfer.lock().unwrap(),
        )
    }
    async fn transfer_quota(&self, _user: &dyn User) -> TransferQuota {
        *self.transfer.lock().unwrap()
    }
    fn max_write_size(&self, quota: DiskQuota, _file_size: i64, _resume: bool) -> i64 {
        quota.allowed_size
    }
    async fn update_user_quota(&self, _user: &dyn User, _files: i64, size: i64) {
        self.user_updates.lock().unwrap().push(size);
    }
    async fn update_folder_quota(
        &self,
        folder: &VirtualFolder,
        _user: &dyn User,
        _files: i64,
        size: i64,
    ) {
        self.folder_updates
            .lock()
            .unwrap()
            .push((folder.virtual_path.clone(), size));
    }
}

#[derive(Default)]
pub(crate) struct RecordingHook {
    deny: Mutex<bool>,
    panic_on_call: Mutex<bool>,
    calls: Mutex<Vec<(HookOp, String)>>,
}

impl RecordingHook {
    pub fn deny(&self) {
        *self.deny.lock().unwrap() = true;
    }
    /// Simulates a buggy hook implementation for unwind-safety tests.
    pub fn panic_on_call(&self) {
        *self.panic_on_call.lock().unwrap() = true;
    }
    pub fn calls(&self) -> Vec<(HookOp, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PreActionHook for RecordingHook {
    async fn execute(
        &self,
        op: HookOp,
        _resolved: &Path,
        virtual_path: &str,
        _size: i64,
        _truncate: bool,
    ) -> Result<(), ScpError> {
        self.calls
            .lock()
            .unwrap()
            .push((op, virtual_path.to_string()));
        let should_panic = *self.panic_on_call.lock().unwrap();
        if should_panic {
            panic!("pre-action hook panicked");
        }
        if *self.deny.lock().unwrap() {
            return Err(ScpError::PermissionDenied);
        }
        Ok(())
    }
}

// -------------------------------------------------------------- transfers

#[derive(Debug, Clone)]
pub(crate) struct TransferRecord {
    pub virtual_path: String,
    pub direction: TransferDirection,
    pub is_new_file: bool,
    pub initial_size: i64,
    pub truncated_size: i64,
    pub max_write_size: i64,
    pub write_path: String,
    pub resolved_path: String,
    pub bytes_written: u64,
    pub closes: usize,
    pub errors: usize,
    pub failed: bool,
}

pub(crate) struct RecordingTransferFactory {
    fs: Arc<MemFs>,
    pub log: Arc<Mutex<Vec<TransferRecord>>>,
    fail_close: Mutex<bool>,
}

impl RecordingTransferFactory {
    pub fn new(fs: Arc<MemFs>) -> Self {
        Self {
            fs,
            log: Arc::new(Mutex::new(Vec::new())),
            fail_close: Mutex::new(false),
        }
    }
    pub fn fail_close(&self) {
        *self.fail_close.lock().unwrap() = true;
    }
}

impl TransferFactory for RecordingTransferFactory {
    fn begin(&self, _connection_id: &str, params: TransferParams) -> Box<dyn Transfer> {
        let mut log = self.log.lock().unwrap();
        let index = log.len();
        log.push(TransferRecord {
            virtual_path: params.virtual_path.clone(),
            direction: params.direction,
            is_new_file: params.is_new_file,
            initial_size: params.initial_size,
            truncated_size: params.truncated_size,
            max_write_size: params.max_write_size,
            write_path: params.write_path.to_string_lossy().into_owned(),
            resolved_path: params.resolved_path.to_string_lossy().into_owned(),
            bytes_written: 0,
            closes: 0,
            errors: 0,
            failed: false,
        });
        drop(log);
        Box::new(RecordingTransfer {
            fs: Arc::clone(&self.fs),
            log: Arc::clone(&self.log),
            index,
            handle: params.handle,
            cancel: params.cancel,
            write_path: params.write_path,
            resolved_path: params.resolved_path,
            failed: false,
            fail_close: *self.fail_close.lock().unwrap(),
        })
    }
}

struct RecordingTransfer {
    fs: Arc<MemFs>,
    log: Arc<Mutex<Vec<TransferRecord>>>,
    index: usize,
    handle: Box<dyn FileHandle>,
    cancel: Option<CancelFn>,
    write_path: PathBuf,
    resolved_path: PathBuf,
    failed: bool,
    fail_close: bool,
}

#[async_trait]
impl Transfer for RecordingTransfer {
    async fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let n = self.handle.write_at(buf, offset).await?;
        let mut log = self.log.lock().unwrap();
        let record = &mut log[self.index];
        record.bytes_written = record.bytes_written.max(offset + n as u64);
        Ok(n)
    }
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.handle.read_at(buf, offset).await
    }
    fn transfer_error(&mut self, _err: &ScpError) {
        self.failed = true;
        let mut log = self.log.lock().unwrap();
        let record = &mut log[self.index];
        record.errors += 1;
        record.failed = true;
    }
    async fn close(&mut self) -> Result<(), ScpError> {
        self.log.lock().unwrap()[self.index].closes += 1;
        let _ = self.handle.close().await;
        if self.failed {
            if let Some(cancel) = self.cancel.take() {
                cancel();
            }
        } else if self.write_path != self.resolved_path {
            // atomic upload: promote the temp file
            self.fs
                .rename(&self.write_path, &self.resolved_path)
                .await
                .map_err(ScpError::Fs)?;
        }
        if self.fail_close {
            return Err(ScpError::Failure("transfer close failed".into()));
        }
        Ok(())
    }
}

// --------------------------------------------------------------- fixture

/// One of everything, wired together.
pub(crate) struct ScpFixture {
    pub fs: Arc<MemFs>,
    pub user: Arc<MemUser>,
    pub registry: Arc<RecordingRegistry>,
    pub quota: Arc<TestQuotaStore>,
    pub hook: Arc<RecordingHook>,
    pub transfers: Arc<RecordingTransferFactory>,
    pub channel_log: Arc<ChannelLog>,
}

impl ScpFixture {
    pub fn new() -> Self {
        Self::with_fs(Arc::new(MemFs::new()))
    }

    pub fn with_fs(fs: Arc<MemFs>) -> Self {
        Self {
            user: Arc::new(MemUser::new(Arc::clone(&fs))),
            registry: Arc::new(RecordingRegistry::default()),
            quota: Arc::new(TestQuotaStore::default()),
            hook: Arc::new(RecordingHook::default()),
            transfers: Arc::new(RecordingTransferFactory::new(Arc::clone(&fs))),
            channel_log: Arc::new(ChannelLog::default()),
            fs,
        }
    }

    pub fn services(&self) -> SessionServices {
        SessionServices {
            registry: Arc::clone(&self.registry) as Arc<dyn ConnectionRegistry>,
            quota: Arc::clone(&self.quota) as Arc<dyn QuotaStore>,
            pre_action: Arc::clone(&self.hook) as Arc<dyn PreActionHook>,
            transfers: Arc::clone(&self.transfers) as Arc<dyn TransferFactory>,
        }
    }

    pub fn channel(&self) -> (DuplexStream, TestChannel) {
        TestChannel::pair_with_log(Arc::clone(&self.channel_log))
    }

    pub fn transfer_log(&self) -> Vec<TransferRecord> {
        self.transfers.log.lock().unwrap().clone()
    }
}

/// Runs one complete SCP command against a scripted peer: writes
/// `script`, signals EOF, then collects everything the engine sent.
pub(crate) async fn drive(
    fx: &ScpFixture,
    args: Vec<String>,
    config: ScpConfig,
    script: &[u8],
) -> (u32, Vec<u8>) {
    crate::util::setup_tracing_for_tests();
    let (mut peer, chan) = fx.channel();
    let user = Arc::clone(&fx.user) as Arc<dyn User>;
    let task = tokio::spawn(crate::scp::handle(
        args,
        user,
        fx.services(),
        config,
        "conn-1",
        chan,
    ));
    peer.write_all(script).await.unwrap();
    peer.shutdown().await.unwrap();
    let mut output = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut peer, &mut output)
        .await
        .unwrap();
    let status = task.await.unwrap();
    (status, output)
}
