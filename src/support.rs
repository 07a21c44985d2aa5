//! Job-scoped cache of reference data.
//!
//! [`SequenceJobSupport`] is filled once per job, before any step runs, and is
//! the only data path available on a remote worker. It travels to the worker
//! as a versioned JSON snapshot of plain records.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineJobError, Result};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const TEMPORARY_GENOME_ID: i64 = -1;
pub const ALIGNER_INDEX_DIR: &str = "alignerIndexes";

/// A data record: numeric id and the file it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpData {
    pub row_id: i64,
    pub file: PathBuf,
}

impl ExpData {
    pub fn new(row_id: i64, file: impl Into<PathBuf>) -> Self {
        Self {
            row_id,
            file: file.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGenome {
    #[serde(default)]
    pub name: Option<String>,
    pub source_fasta: PathBuf,
    #[serde(default)]
    pub working_fasta: Option<PathBuf>,
    #[serde(default)]
    pub genome_id: Option<i64>,
    #[serde(default)]
    pub fasta_data_id: Option<i64>,
}

impl ReferenceGenome {
    pub fn new(source_fasta: impl Into<PathBuf>, genome_id: Option<i64>) -> Self {
        Self {
            name: None,
            source_fasta: source_fasta.into(),
            working_fasta: None,
            genome_id,
            fasta_data_id: None,
        }
    }

    /// Ad hoc genomes have no saved id.
    pub fn is_temporary(&self) -> bool {
        self.genome_id.is_none()
    }

    pub fn cache_key(&self) -> i64 {
        self.genome_id.unwrap_or(TEMPORARY_GENOME_ID)
    }

    pub fn working_fasta_file(&self) -> &Path {
        self.working_fasta.as_deref().unwrap_or(&self.source_fasta)
    }

    pub fn set_working_fasta(&mut self, fasta: impl Into<PathBuf>) {
        self.working_fasta = Some(fasta.into());
    }

    pub fn fasta_index(&self) -> PathBuf {
        append_extension(self.working_fasta_file(), "fai")
    }

    pub fn sequence_dictionary(&self) -> PathBuf {
        self.working_fasta_file().with_extension("dict")
    }

    /// Directory holding the index built by aligner `name`.
    pub fn aligner_index_dir(&self, name: &str) -> PathBuf {
        let parent = |path: &Path| {
            path.parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        };
        if self.is_temporary() {
            return parent(self.working_fasta_file()).join(name);
        }
        match &self.working_fasta {
            None => parent(&self.source_fasta).join(ALIGNER_INDEX_DIR).join(name),
            Some(working) => parent(working).join(name),
        }
    }
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".");
    raw.push(extension);
    PathBuf::from(raw)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadData {
    pub file1: PathBuf,
    #[serde(default)]
    pub file2: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readset {
    pub row_id: i64,
    pub name: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub read_data: Vec<ReadData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisModel {
    pub row_id: i64,
    #[serde(default)]
    pub readset_id: Option<i64>,
    #[serde(default)]
    pub alignment_data_id: Option<i64>,
    #[serde(default)]
    pub library_id: Option<i64>,
    #[serde(default)]
    pub reference_library_data_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Read-only access to the metadata store. Only reachable while the job is
/// being prepared; remote workers rely on [`SequenceJobSupport`] alone.
pub trait MetadataStore {
    fn data_file(&self, data_id: i64) -> Option<PathBuf>;
    fn readset(&self, readset_id: i64) -> Option<Readset>;
    fn reference_genome(&self, genome_id: i64) -> Option<ReferenceGenome>;
}

/// A [`MetadataStore`] backed by plain maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryMetadataStore {
    #[serde(default)]
    pub data: Vec<ExpData>,
    #[serde(default)]
    pub readsets: Vec<Readset>,
    #[serde(default)]
    pub genomes: Vec<ReferenceGenome>,
}

impl MetadataStore for InMemoryMetadataStore {
    fn data_file(&self, data_id: i64) -> Option<PathBuf> {
        self.data
            .iter()
            .find(|data| data.row_id == data_id)
            .map(|data| data.file.clone())
    }

    fn readset(&self, readset_id: i64) -> Option<Readset> {
        self.readsets
            .iter()
            .find(|rs| rs.row_id == readset_id)
            .cloned()
    }

    fn reference_genome(&self, genome_id: i64) -> Option<ReferenceGenome> {
        self.genomes
            .iter()
            .find(|genome| genome.genome_id == Some(genome_id))
            .cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequenceJobSupport {
    cached_data: BTreeMap<i64, PathBuf>,
    cached_readsets: BTreeMap<i64, Readset>,
    cached_analyses: BTreeMap<i64, AnalysisModel>,
    cached_genomes: BTreeMap<i64, ReferenceGenome>,
    cached_objects: BTreeMap<String, Value>,
    modified_since_serialize: bool,
}

impl SequenceJobSupport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_modified_since_serialize(&self) -> bool {
        self.modified_since_serialize
    }

    pub fn cache_exp_data(&mut self, data: ExpData) {
        self.modified_since_serialize = true;
        self.cached_data.insert(data.row_id, data.file);
    }

    pub fn get_cached_data(&self, data_id: i64) -> Option<&Path> {
        self.cached_data.get(&data_id).map(PathBuf::as_path)
    }

    pub fn get_all_cached_data(&self) -> &BTreeMap<i64, PathBuf> {
        &self.cached_data
    }

    /// Caches `readset`, replacing any readset with the same id.
    pub fn cache_readset(&mut self, readset: Readset, allow_archived: bool) -> Result<()> {
        if readset.archived && !allow_archived {
            return Err(PipelineJobError::ArchivedReadset { id: readset.row_id });
        }
        self.modified_since_serialize = true;
        self.cached_readsets.insert(readset.row_id, readset);
        Ok(())
    }

    pub fn cache_readset_by_id(
        &mut self,
        readset_id: i64,
        store: &dyn MetadataStore,
        allow_archived: bool,
    ) -> Result<()> {
        let readset = store
            .readset(readset_id)
            .ok_or(PipelineJobError::MissingDependency {
                kind: "readset",
                id: readset_id,
            })?;
        self.cache_readset(readset, allow_archived)
    }

    /// Caches `analysis` together with its alignment data, readset and genome.
    pub fn cache_analysis(
        &mut self,
        analysis: AnalysisModel,
        store: &dyn MetadataStore,
        allow_archived: bool,
    ) -> Result<()> {
        self.modified_since_serialize = true;

        if let Some(data_id) = analysis.alignment_data_id {
            self.cache_data_from_store(data_id, store);
        }

        if let Some(readset_id) = analysis.readset_id {
            self.cache_readset_by_id(readset_id, store, allow_archived)?;
        }

        if let Some(library_id) = analysis.library_id {
            match store.reference_genome(library_id) {
                Some(genome) => {
                    if let Some(fasta_id) = genome.fasta_data_id {
                        self.cache_data_from_store(fasta_id, store);
                    }
                    self.cache_genome(genome);
                }
                None => warn!(library_id, "Unable to find reference genome for analysis"),
            }
        }

        if let Some(data_id) = analysis.reference_library_data_id {
            self.cache_data_from_store(data_id, store);
        }

        self.cached_analyses.insert(analysis.row_id, analysis);
        Ok(())
    }

    fn cache_data_from_store(&mut self, data_id: i64, store: &dyn MetadataStore) {
        match store.data_file(data_id) {
            Some(file) => self.cache_exp_data(ExpData::new(data_id, file)),
            None => warn!(data_id, "Unable to resolve data file"),
        }
    }

    pub fn cache_genome(&mut self, genome: ReferenceGenome) {
        self.modified_since_serialize = true;
        self.cached_genomes.insert(genome.cache_key(), genome);
    }

    /// A declared readset dependency. Missing ids are errors.
    pub fn get_cached_readset(&self, readset_id: i64) -> Result<&Readset> {
        if readset_id < 1 {
            return Err(PipelineJobError::InvalidDependencyId {
                kind: "readset",
                id: readset_id,
            });
        }
        self.find_cached_readset(readset_id)
            .ok_or(PipelineJobError::MissingDependency {
                kind: "readset",
                id: readset_id,
            })
    }

    pub fn find_cached_readset(&self, readset_id: i64) -> Option<&Readset> {
        self.cached_readsets.get(&readset_id)
    }

    pub fn get_cached_readsets(&self) -> impl Iterator<Item = &Readset> {
        self.cached_readsets.values()
    }

    pub fn get_cached_analysis(&self, analysis_id: i64) -> Result<&AnalysisModel> {
        self.find_cached_analysis(analysis_id)
            .ok_or(PipelineJobError::MissingDependency {
                kind: "analysis",
                id: analysis_id,
            })
    }

    pub fn find_cached_analysis(&self, analysis_id: i64) -> Option<&AnalysisModel> {
        self.cached_analyses.get(&analysis_id)
    }

    pub fn get_cached_analyses(&self) -> impl Iterator<Item = &AnalysisModel> {
        self.cached_analyses.values()
    }

    pub fn get_cached_genome(&self, genome_id: i64) -> Result<&ReferenceGenome> {
        self.find_cached_genome(genome_id)
            .ok_or(PipelineJobError::MissingDependency {
                kind: "genome",
                id: genome_id,
            })
    }

    pub fn find_cached_genome(&self, genome_id: i64) -> Option<&ReferenceGenome> {
        self.cached_genomes.get(&genome_id)
    }

    pub fn get_cached_genomes(&self) -> impl Iterator<Item = &ReferenceGenome> {
        self.cached_genomes.values()
    }

    pub fn cache_object<T: Serialize>(&mut self, key: impl Into<String>, object: &T) -> Result<()> {
        let value = serde_json::to_value(object)?;
        self.modified_since_serialize = true;
        self.cached_objects.insert(key.into(), value);
        Ok(())
    }

    pub fn get_cached_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.cached_objects.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn to_snapshot(&self) -> SupportSnapshot {
        SupportSnapshot {
            version: SNAPSHOT_VERSION,
            data: self
                .cached_data
                .iter()
                .map(|(id, file)| ExpData::new(*id, file.clone()))
                .collect(),
            readsets: self.cached_readsets.values().cloned().collect(),
            analyses: self.cached_analyses.values().cloned().collect(),
            genomes: self.cached_genomes.values().cloned().collect(),
            objects: self.cached_objects.clone(),
        }
    }

    pub fn from_snapshot(snapshot: SupportSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PipelineJobError::UnsupportedSnapshotVersion(
                snapshot.version,
            ));
        }
        Ok(Self {
            cached_data: snapshot
                .data
                .into_iter()
                .map(|data| (data.row_id, data.file))
                .collect(),
            cached_readsets: snapshot
                .readsets
                .into_iter()
                .map(|rs| (rs.row_id, rs))
                .collect(),
            cached_analyses: snapshot
                .analyses
                .into_iter()
                .map(|model| (model.row_id, model))
                .collect(),
            cached_genomes: snapshot
                .genomes
                .into_iter()
                .map(|genome| (genome.cache_key(), genome))
                .collect(),
            cached_objects: snapshot.objects,
            modified_since_serialize: false,
        })
    }

    pub fn write_to_disk(&mut self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|err| {
            PipelineJobError::io(
                format!("Failed to create support snapshot: {}", path.display()),
                err,
            )
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.to_snapshot())?;
        debug!(path = %path.display(), "Support snapshot written");
        self.modified_since_serialize = false;
        Ok(())
    }

    pub fn read_from_disk(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            PipelineJobError::io(
                format!("Failed to open support snapshot: {}", path.display()),
                err,
            )
        })?;
        let snapshot: SupportSnapshot = serde_json::from_reader(BufReader::new(file))?;
        Self::from_snapshot(snapshot)
    }
}

/// Wire form of [`SequenceJobSupport`] shipped to remote workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportSnapshot {
    pub version: u32,
    #[serde(default)]
    pub data: Vec<ExpData>,
    #[serde(default)]
    pub readsets: Vec<Readset>,
    #[serde(default)]
    pub analyses: Vec<AnalysisModel>,
    #[serde(default)]
    pub genomes: Vec<ReferenceGenome>,
    #[serde(default)]
    pub objects: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn readset(id: i64) -> Readset {
        Readset {
            row_id: id,
            name: format!("readset-{id}"),
            subject_id: None,
            platform: Some("ILLUMINA".into()),
            archived: false,
            read_data: vec![ReadData {
                file1: PathBuf::from(format!("/data/rs{id}_R1.fastq.gz")),
                file2: None,
            }],
        }
    }

    #[test]
    fn readsets_are_replaced_by_id() {
        let mut support = SequenceJobSupport::new();
        support.cache_readset(readset(100), false).unwrap();
        let mut renamed = readset(100);
        renamed.name = "renamed".into();
        support.cache_readset(renamed, false).unwrap();

        assert_eq!(support.get_cached_readsets().count(), 1);
        assert_eq!(support.get_cached_readset(100).unwrap().name, "renamed");
    }

    #[test]
    fn archived_readsets_are_rejected_unless_allowed() {
        let mut support = SequenceJobSupport::new();
        let mut archived = readset(5);
        archived.archived = true;
        assert!(matches!(
            support.cache_readset(archived.clone(), false),
            Err(PipelineJobError::ArchivedReadset { id: 5 })
        ));
        support.cache_readset(archived, true).unwrap();
        assert!(support.find_cached_readset(5).is_some());
    }

    #[test]
    fn missing_dependencies_are_errors() {
        let support = SequenceJobSupport::new();
        assert!(matches!(
            support.get_cached_genome(3),
            Err(PipelineJobError::MissingDependency { kind: "genome", id: 3 })
        ));
        assert!(matches!(
            support.get_cached_readset(0),
            Err(PipelineJobError::InvalidDependencyId { .. })
        ));
        assert!(support.get_cached_data(9).is_none());
    }

    #[test]
    fn temporary_genome_uses_reserved_key() {
        let mut support = SequenceJobSupport::new();
        support.cache_genome(ReferenceGenome::new("/tmp/adhoc.fasta", None));
        assert!(support.find_cached_genome(TEMPORARY_GENOME_ID).is_some());
    }

    #[test]
    fn genome_derived_paths() {
        let mut genome = ReferenceGenome::new("/refs/42/ref.fasta", Some(42));
        assert_eq!(genome.fasta_index(), PathBuf::from("/refs/42/ref.fasta.fai"));
        assert_eq!(
            genome.sequence_dictionary(),
            PathBuf::from("/refs/42/ref.dict")
        );
        assert_eq!(
            genome.aligner_index_dir("bwa"),
            PathBuf::from("/refs/42/alignerIndexes/bwa")
        );
        genome.set_working_fasta("/scratch/cache/ref.fasta");
        assert_eq!(
            genome.aligner_index_dir("bwa"),
            PathBuf::from("/scratch/cache/bwa")
        );
    }

    #[test]
    fn analysis_caching_pulls_dependencies() {
        let mut genome = ReferenceGenome::new("/refs/7/ref.fasta", Some(7));
        genome.fasta_data_id = Some(70);
        let store = InMemoryMetadataStore {
            data: vec![
                ExpData::new(11, "/data/aligned.bam"),
                ExpData::new(70, "/refs/7/ref.fasta"),
            ],
            readsets: vec![readset(3)],
            genomes: vec![genome],
        };
        let analysis = AnalysisModel {
            row_id: 1,
            readset_id: Some(3),
            alignment_data_id: Some(11),
            library_id: Some(7),
            reference_library_data_id: None,
            description: None,
        };

        let mut support = SequenceJobSupport::new();
        support.cache_analysis(analysis, &store, false).unwrap();

        assert!(support.get_cached_analysis(1).is_ok());
        assert!(support.get_cached_readset(3).is_ok());
        assert!(support.get_cached_genome(7).is_ok());
        assert_eq!(
            support.get_cached_data(11),
            Some(Path::new("/data/aligned.bam"))
        );
        assert_eq!(support.get_all_cached_data().len(), 2);
    }

    #[test]
    fn snapshot_survives_disk_transfer() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("support.json");

        let mut support = SequenceJobSupport::new();
        support.cache_exp_data(ExpData::new(4, "/"));
        support.cache_readset(readset(100), false).unwrap();
        support.cache_genome(ReferenceGenome::new("/refs/2/ref.fasta", Some(2)));
        support.cache_object("cachedInt", &1).unwrap();
        support
            .cache_object("cachedMap", &BTreeMap::from([(1, 1)]))
            .unwrap();
        assert!(support.is_modified_since_serialize());

        support.write_to_disk(&path).unwrap();
        assert!(!support.is_modified_since_serialize());

        let restored = SequenceJobSupport::read_from_disk(&path).unwrap();
        assert_eq!(restored.get_cached_data(4), Some(Path::new("/")));
        assert_eq!(restored.get_cached_readset(100).unwrap().row_id, 100);
        assert!(restored.get_cached_genome(2).is_ok());
        assert_eq!(
            restored.get_cached_object::<i32>("cachedInt").unwrap(),
            Some(1)
        );
        let map: BTreeMap<i32, i32> = restored.get_cached_object("cachedMap").unwrap().unwrap();
        assert_eq!(map.get(&1), Some(&1));
    }

    #[test]
    fn unknown_snapshot_version_is_rejected() {
        let snapshot = SupportSnapshot {
            version: 9,
            data: Vec::new(),
            readsets: Vec::new(),
            analyses: Vec::new(),
            genomes: Vec::new(),
            objects: BTreeMap::new(),
        };
        assert!(matches!(
            SequenceJobSupport::from_snapshot(snapshot),
            Err(PipelineJobError::UnsupportedSnapshotVersion(9))
        ));
    }
}
