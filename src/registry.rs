//! Dataset registry: maps identifiers to remote files.

use crate::error::DatasetError;
use crate::extract::ArchiveFormat;
use crate::types::{DatasetSpec, RemoteFile, Split, SCRATCH_DIR};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One file of a dataset split, relative to the dataset's mirrors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub file_name: String,
    pub md5: String,
    #[serde(default)]
    pub length: Option<u64>,
    /// Overrides the format inferred from `file_name`.
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
}

/// A named dataset with its mirrors and per-split files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    pub name: String,
    /// Base URLs, tried in order.
    pub mirrors: Vec<String>,
    pub train: Vec<ResourceEntry>,
    pub test: Vec<ResourceEntry>,
}

impl DatasetEntry {
    fn resources(&self, split: Split) -> &[ResourceEntry] {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct RegistryFile {
    datasets: Vec<DatasetEntry>,
}

/// Immutable table of known datasets.
///
/// # Example
///
/// ```
/// use datafetch::{Registry, Split};
///
/// let registry = Registry::builtin();
/// let spec = registry.resolve("mnist", Split::Train, "/tmp/data").unwrap();
/// assert_eq!(spec.id, "MNIST");
/// assert_eq!(spec.files.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    entries: Vec<DatasetEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// Builds a registry from explicit entries, validating them.
    pub fn new(entries: Vec<DatasetEntry>) -> Result<Self, DatasetError> {
        validate(&entries)?;
        Ok(Self { entries })
    }

    /// MNIST and Fashion-MNIST with their upstream mirrors.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                DatasetEntry {
                    name: "MNIST".into(),
                    mirrors: vec![
                        "https://ossci-datasets.s3.amazonaws.com/mnist/".into(),
                        "http://yann.lecun.com/exdb/mnist/".into(),
                    ],
                    train: vec![
                        resource(
                            "train-images-idx3-ubyte.gz",
                            "f68b3c2dcbeaaa9fbdd348bbdeb94873",
                            9_912_422,
                        ),
                        resource(
                            "train-labels-idx1-ubyte.gz",
                            "d53e105ee54ea40749a09fcbcd1e9432",
                            28_881,
                        ),
                    ],
                    test: vec![
                        resource(
                            "t10k-images-idx3-ubyte.gz",
                            "9fb629c4189551a2d022fa330f9573f3",
                            1_648_877,
                        ),
                        resource(
                            "t10k-labels-idx1-ubyte.gz",
                            "ec29112dd5afa0611ce80d1b7f02629c",
                            4_542,
                        ),
                    ],
                },
                DatasetEntry {
                    name: "FashionMNIST".into(),
                    mirrors: vec![
                        "http://fashion-mnist.s3-website.eu-central-1.amazonaws.com/".into(),
                    ],
                    train: vec![
                        resource(
                            "train-images-idx3-ubyte.gz",
                            "8d4fb7e6c68d591d4c3dfef9ec88bf0d",
                            26_421_880,
                        ),
                        resource(
                            "train-labels-idx1-ubyte.gz",
                            "25c81989df183df01b3e8a0aad5dffbe",
                            29_515,
                        ),
                    ],
                    test: vec![
                        resource(
                            "t10k-images-idx3-ubyte.gz",
                            "bef4ecab320f06d8554ea6380940ec79",
                            4_422_102,
                        ),
                        resource(
                            "t10k-labels-idx1-ubyte.gz",
                            "bb300cfdad3c16e7a12a480ee83cd310",
                            5_148,
                        ),
                    ],
                },
            ],
        }
    }

    /// Parses a `{"datasets": [...]}` table.
    pub fn from_json_str(json: &str) -> Result<Self, DatasetError> {
        let file: RegistryFile = serde_json::from_str(json)?;
        Self::new(file.datasets)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| DatasetError::fs(path, e))?;
        Self::from_json_str(&content)
    }

    pub fn to_json(&self) -> Result<String, DatasetError> {
        let file = RegistryFile {
            datasets: self.entries.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&DatasetEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(id.trim()))
    }

    /// Resolves `id`/`split` into a [`DatasetSpec`] rooted at `dest`.
    ///
    /// Pure: performs no I/O. The target is `<dest>/<name>/<split>` and the
    /// scratch directory `<dest>/.datafetch`.
    pub fn resolve(
        &self,
        id: &str,
        split: Split,
        dest: impl AsRef<Path>,
    ) -> Result<DatasetSpec, DatasetError> {
        let entry = self.get(id).ok_or_else(|| DatasetError::UnknownDataset {
            id: id.to_string(),
            split,
        })?;
        let dest = dest.as_ref();

        let files = entry
            .resources(split)
            .iter()
            .map(|res| RemoteFile {
                file_name: res.file_name.clone(),
                urls: entry
                    .mirrors
                    .iter()
                    .map(|mirror| format!("{}/{}", mirror.trim_end_matches('/'), res.file_name))
                    .collect(),
                md5: res.md5.to_ascii_lowercase(),
                length: res.length,
                format: res
                    .format
                    .unwrap_or_else(|| ArchiveFormat::from_file_name(&res.file_name)),
            })
            .collect();

        Ok(DatasetSpec {
            id: entry.name.clone(),
            split,
            files,
            target: dest.join(&entry.name).join(split.as_str()),
            scratch: dest.join(SCRATCH_DIR),
        })
    }
}

fn resource(file_name: &str, md5: &str, length: u64) -> ResourceEntry {
    ResourceEntry {
        file_name: file_name.to_string(),
        md5: md5.to_string(),
        length: Some(length),
        format: None,
    }
}

fn validate(entries: &[DatasetEntry]) -> Result<(), DatasetError> {
    let mut seen = HashSet::new();

    for entry in entries {
        let name = entry.name.trim();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(DatasetError::Registry(format!(
                "invalid dataset name '{}'",
                entry.name
            )));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(DatasetError::Registry(format!(
                "duplicate dataset '{}'",
                entry.name
            )));
        }
        if entry.mirrors.is_empty() {
            return Err(DatasetError::Registry(format!(
                "dataset '{}' has no mirrors",
                entry.name
            )));
        }
        for res in entry.train.iter().chain(&entry.test) {
            let md5_ok = res.md5.len() == 32 && res.md5.chars().all(|c| c.is_ascii_hexdigit());
            if !md5_ok {
                return Err(DatasetError::Registry(format!(
                    "dataset '{}' file '{}' has malformed md5 '{}'",
                    entry.name, res.file_name, res.md5
                )));
            }
            if res.file_name.is_empty() || res.file_name.contains(['/', '\\']) {
                return Err(DatasetError::Registry(format!(
                    "dataset '{}' has invalid file name '{}'",
                    entry.name, res.file_name
                )));
            }
        }
    }

    Ok(())
}
