//! Project registry: publish, attach and tear down trees of shared arrays
//!
//! Cleanup authority moves exactly once per segment. A segment created by
//! [`Registry::publish`] removes itself if anything fails before its project
//! record is written; only after the record is durable is it released to
//! the project, from then on surviving every process until
//! [`Registry::teardown`]. Until then segments and record are also
//! registered with an out-of-process cleanup agent, which removes them if
//! the publisher is killed or aborts.
//!
//! Two publishers using `overwrite` on the same project at the same time can
//! leave a record pointing at segments the other one removed. Callers that
//! need this must serialize publishers themselves (a lock file, for example).

use crate::agent;
use crate::array::Array;
use crate::meta::{segment_len, MetadataTree, SegmentDescriptor};
use crate::progress::{Progress, ProgressObserver};
use crate::shm::SharedMemory;
use crate::store::{ProjectStore, StoreConfig};
use crate::tree::Tree;
use crate::view::{AccessMode, ArrayView};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Attempts at finding an unused random segment name
const NAME_ATTEMPTS: usize = 3;

/// Publishes and tears down projects under one [`ProjectStore`].
#[derive(Debug, Clone)]
pub struct Registry {
    store: ProjectStore,
}

impl Registry {
    pub fn new(config: StoreConfig) -> Result<Self> {
        Ok(Self {
            store: ProjectStore::new(config)?,
        })
    }

    pub fn from_store(store: ProjectStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    /// Total bytes of every array in `arrays`.
    pub fn size_of(arrays: &Tree<Array>) -> u64 {
        arrays.leaves().iter().map(|(_, a)| a.nbytes() as u64).sum()
    }

    /// Total bytes of every array recorded for `project`.
    pub fn size_of_project(&self, project: &str) -> Result<u64> {
        Ok(self.store.load(project)?.nbytes()? as u64)
    }

    /// Copy `arrays` into shared memory and record them under `project`.
    ///
    /// The segments outlive this process; only [`teardown`](Self::teardown)
    /// removes them. With `overwrite`, an existing project is torn down
    /// completely first; without it an existing project is left untouched
    /// and `AlreadyExists` is returned.
    pub fn publish(&self, project: &str, arrays: &Tree<Array>, overwrite: bool) -> Result<PathBuf> {
        self.publish_with_progress(project, arrays, overwrite, None)
    }

    /// [`publish`](Self::publish), reporting copied bytes to `observer`.
    pub fn publish_with_progress(
        &self,
        project: &str,
        arrays: &Tree<Array>,
        overwrite: bool,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<PathBuf> {
        let (path, mut handles) = self.publish_segments(project, arrays, overwrite, observer)?;
        // The record is durable: cleanup authority moves to it.
        for shm in &mut handles {
            shm.release_to_project();
        }
        agent::forget_file(&path);
        debug!(project, segments = handles.len(), "published persistently");
        Ok(path)
    }

    /// Publish for the lifetime of the returned guard.
    ///
    /// Dropping the [`Publication`] tears the project down, including when
    /// the caller returns early with an error or unwinds from a panic.
    pub fn publish_scoped(&self, project: &str, arrays: &Tree<Array>, overwrite: bool) -> Result<Publication<'_>> {
        let (path, handles) = self.publish_segments(project, arrays, overwrite, None)?;
        Ok(Publication {
            registry: self,
            project: project.to_string(),
            path,
            handles,
            done: false,
        })
    }

    /// Publish, run `f` with the record path, then tear down on every exit.
    pub fn with_published<R>(
        &self,
        project: &str,
        arrays: &Tree<Array>,
        overwrite: bool,
        f: impl FnOnce(&Path) -> R,
    ) -> Result<R> {
        let publication = self.publish_scoped(project, arrays, overwrite)?;
        let result = f(publication.path());
        publication.teardown()?;
        Ok(result)
    }

    fn publish_segments(
        &self,
        project: &str,
        arrays: &Tree<Array>,
        overwrite: bool,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<(PathBuf, Vec<SharedMemory>)> {
        if arrays.is_leaf() {
            return Err(Error::InvalidShape(
                "a project must be published from a group of arrays".to_string(),
            ));
        }
        if self.store.exists(project)? {
            if !overwrite {
                return Err(Error::AlreadyExists(format!(
                    "project '{}' ({})",
                    project,
                    self.store.path_for(project)?.display()
                )));
            }
            debug!(project, "overwrite: tearing down existing project");
            self.teardown(project)?;
        }

        let total = Self::size_of(arrays);
        debug!(project, bytes = total, "transferring arrays to shared memory");
        let mut progress = Progress::start(observer, total);
        let (tree, handles) = MetadataTree::from_arrays(arrays, |key, array| {
            let shm = self.create_segment(project, key, array)?;
            progress.advance(array.nbytes() as u64);
            Ok((SegmentDescriptor::new(&shm, array), shm))
        })?;
        drop(progress);

        // On failure the handles drop here and remove their segments.
        let path = self.store.save(project, &tree, overwrite)?;
        agent::track_file(&path);
        debug!(project, record = %path.display(), "record written");
        Ok((path, handles))
    }

    fn create_segment(&self, project: &str, key: &str, array: &Array) -> Result<SharedMemory> {
        let mut attempt = 0;
        let mut shm = loop {
            let name = self.store.segment_name(project);
            match SharedMemory::create(&name, segment_len(array.nbytes())) {
                Ok(shm) => break shm,
                Err(Error::AlreadyExists(_)) if attempt + 1 < NAME_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e),
            }
        };
        shm.as_mut_slice()[..array.nbytes()].copy_from_slice(array.as_bytes());
        debug!(key, segment = shm.name(), bytes = array.nbytes(), "array transferred");
        Ok(shm)
    }

    /// Attach every array of `project` for reading and writing.
    pub fn attach(&self, project: &str) -> Result<Attached> {
        self.attach_with(project, AccessMode::ReadWrite)
    }

    /// Attach every array of `project`.
    ///
    /// Leaves whose segment cannot be opened are kept as errors in the
    /// result; see [`Attached::missing`]. Attaching never takes cleanup
    /// authority, so the attaching process may exit freely.
    pub fn attach_with(&self, project: &str, mode: AccessMode) -> Result<Attached> {
        let tree = self.store.load(project)?;
        debug!(project, arrays = tree.leaf_count(), "attaching");
        let mut views = tree.to_views(mode);
        for (_, view) in views.leaves_mut() {
            if let Ok(view) = view {
                view.segment_mut().release_to_project();
            }
        }
        Ok(Attached {
            project: project.to_string(),
            views,
        })
    }

    /// Remove every segment of `project`, then its record.
    ///
    /// A project without a record is already torn down and yields an empty
    /// report. Segments that are already gone are logged and reported as
    /// [`LeafOutcome::Missing`]. A malformed record is an error and is left
    /// in place.
    pub fn teardown(&self, project: &str) -> Result<TeardownReport> {
        self.teardown_holding(project, HashMap::new())
    }

    fn teardown_holding(&self, project: &str, mut held: HashMap<String, SharedMemory>) -> Result<TeardownReport> {
        let tree = match self.store.load(project) {
            Ok(tree) => tree,
            Err(Error::NotFound(_)) => {
                debug!(project, "nothing to tear down");
                return Ok(TeardownReport::empty(project));
            }
            Err(e) => return Err(e),
        };

        let mut outcomes = Vec::with_capacity(tree.leaf_count());
        for (key, descriptor) in tree.leaves() {
            let unlinked = match held.remove(&descriptor.public_name) {
                Some(shm) => shm.unlink(),
                None => SharedMemory::unlink_name(&descriptor.public_name),
            };
            let outcome = match unlinked {
                Ok(()) => {
                    debug!(key = %key, segment = %descriptor.public_name, "closed and unlinked");
                    LeafOutcome::Unlinked
                }
                Err(e) if e.is_not_found() => {
                    warn!(key = %key, segment = %descriptor.public_name, "shared memory not found");
                    LeafOutcome::Missing
                }
                Err(e) => {
                    warn!(key = %key, segment = %descriptor.public_name, error = %e, "unlink failed");
                    LeafOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((key, outcome));
        }

        let record = self.store.path_for(project)?;
        self.store.remove(project)?;
        debug!(project, record = %record.display(), "record removed");
        Ok(TeardownReport {
            project: project.to_string(),
            record: Some(record),
            outcomes,
        })
    }

    /// Summary of one project for listings.
    pub fn inspect(&self, project: &str) -> Result<ProjectInfo> {
        let tree = self.store.load(project)?;
        let entries = tree
            .leaves()
            .into_iter()
            .map(|(key, d)| {
                Ok(LeafInfo {
                    nbytes: d.nbytes()? as u64,
                    shape: d.shape.clone(),
                    dtype: d.dtype.to_string(),
                    attrs: d.attrs.keys().cloned().collect(),
                    public_name: d.public_name.clone(),
                    present: SharedMemory::exists(&d.public_name),
                    key,
                })
            })
            .collect::<Result<_>>()?;
        Ok(ProjectInfo {
            project: project.to_string(),
            path: self.store.path_for(project)?,
            entries,
        })
    }

    /// Every known project with its summary.
    ///
    /// A project whose record cannot be read carries the error instead of
    /// failing the whole listing.
    pub fn list(&self) -> Result<Vec<ProjectListing>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|(project, path)| {
                let info = self.inspect(&project);
                ProjectListing { project, path, info }
            })
            .collect())
    }
}

/// A project published for a limited scope.
///
/// Holds the created segments with their auto-cleanup authority; dropping
/// the guard removes the record and every segment.
#[derive(Debug)]
pub struct Publication<'r> {
    registry: &'r Registry,
    project: String,
    path: PathBuf,
    handles: Vec<SharedMemory>,
    done: bool,
}

impl Publication<'_> {
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Record location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tear the project down now and report per-segment outcomes.
    pub fn teardown(mut self) -> Result<TeardownReport> {
        self.done = true;
        self.teardown_now()
    }

    fn teardown_now(&mut self) -> Result<TeardownReport> {
        let held = self
            .handles
            .drain(..)
            .map(|shm| (shm.name().to_string(), shm))
            .collect();
        let report = self.registry.teardown_holding(&self.project, held);
        if report.is_ok() {
            agent::forget_file(&self.path);
        }
        report
    }
}

impl Drop for Publication<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.teardown_now() {
            warn!(project = %self.project, error = %e, "scoped teardown failed");
        }
    }
}

/// Views of an attached project.
#[derive(Debug)]
pub struct Attached {
    project: String,
    views: Tree<Result<ArrayView>>,
}

impl Attached {
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Every leaf, attached or failed.
    pub fn views(&self) -> &Tree<Result<ArrayView>> {
        &self.views
    }

    /// Attached view at `path`, if that leaf could be attached.
    pub fn get(&self, path: &str) -> Option<&ArrayView> {
        self.views.leaf(path)?.as_ref().ok()
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ArrayView> {
        self.views.leaf_mut(path)?.as_mut().ok()
    }

    /// Leaves that could not be attached, with the reason.
    pub fn missing(&self) -> Vec<(String, &Error)> {
        self.views
            .leaves()
            .into_iter()
            .filter_map(|(key, view)| view.as_ref().err().map(|e| (key, e)))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// All views, or the first leaf error.
    pub fn into_complete(self) -> Result<Tree<ArrayView>> {
        self.views.transpose()
    }

    pub fn into_views(self) -> Tree<Result<ArrayView>> {
        self.views
    }
}

/// What happened to one segment during teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafOutcome {
    Unlinked,
    /// The segment was already gone
    Missing,
    Failed(String),
}

/// Per-segment result of a teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub project: String,
    /// Record that was removed; `None` when the project had no record
    pub record: Option<PathBuf>,
    pub outcomes: Vec<(String, LeafOutcome)>,
}

impl TeardownReport {
    fn empty(project: &str) -> Self {
        Self {
            project: project.to_string(),
            record: None,
            outcomes: Vec::new(),
        }
    }

    fn keys(&self, wanted: fn(&LeafOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| wanted(outcome))
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn unlinked(&self) -> Vec<&str> {
        self.keys(|o| matches!(o, LeafOutcome::Unlinked))
    }

    pub fn missing(&self) -> Vec<&str> {
        self.keys(|o| matches!(o, LeafOutcome::Missing))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.keys(|o| matches!(o, LeafOutcome::Failed(_)))
    }

    /// Whether there was nothing to tear down.
    pub fn is_noop(&self) -> bool {
        self.record.is_none()
    }
}

/// One array of a project listing
#[derive(Debug, Clone, PartialEq)]
pub struct LeafInfo {
    pub key: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    pub nbytes: u64,
    pub attrs: Vec<String>,
    pub public_name: String,
    /// Whether the segment can currently be opened
    pub present: bool,
}

/// Summary of a published project
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectInfo {
    pub project: String,
    pub path: PathBuf,
    pub entries: Vec<LeafInfo>,
}

impl ProjectInfo {
    pub fn array_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.nbytes).sum()
    }

    /// True when every segment is present.
    pub fn is_intact(&self) -> bool {
        self.entries.iter().all(|e| e.present)
    }
}

/// Entry of [`Registry::list`]
#[derive(Debug)]
pub struct ProjectListing {
    pub project: String,
    pub path: PathBuf,
    pub info: Result<ProjectInfo>,
}
