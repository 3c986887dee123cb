use crate::dataset::{LayerShape, NUM_LAYERS, ShowerDataset, ShowerImages};
use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array1, Array3, ArrayD, Axis, Ix3, concatenate};
use ndarray_npy::NpzReader;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Particle class name mapped to the data file holding its events.
pub type DatasetManifest = BTreeMap<String, PathBuf>;

const LAYER_KEYS: [&str; NUM_LAYERS] = ["layer_0", "layer_1", "layer_2"];
const ENERGY_KEY: &str = "energy";

#[derive(Debug, Clone)]
pub struct DatasetLoadOptions {
    /// Multiplier applied to every pixel (stored in MeV, trained in GeV).
    pub image_scale: f32,
    /// Seed of the single shuffle applied after concatenation; `None` keeps file order.
    pub shuffle_seed: Option<u64>,
}

impl Default for DatasetLoadOptions {
    fn default() -> Self {
        Self { image_scale: 1.0 / 1000.0, shuffle_seed: Some(0) }
    }
}

/// Parse a YAML manifest; relative data paths resolve against the manifest's directory.
pub fn read_manifest(path: &Path) -> TrainingResult<DatasetManifest> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to read dataset manifest {}: {e}", path.display()))
    })?;
    let manifest: DatasetManifest = serde_yaml::from_str(&contents)?;
    if manifest.is_empty() {
        return Err(TrainingError::Dataset(format!(
            "dataset manifest {} lists no particle classes",
            path.display()
        )));
    }

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(manifest
        .into_iter()
        .map(|(name, file)| {
            let file = if file.is_relative() { base.join(file) } else { file };
            (name, file)
        })
        .collect())
}

/// Load every class listed in the manifest into one aligned dataset.
///
/// Class indices follow the sorted order of class names.
pub fn load_dataset(manifest_path: &Path, options: &DatasetLoadOptions) -> TrainingResult<ShowerDataset> {
    let manifest = read_manifest(manifest_path)?;
    info!("{} particle types found", manifest.len());
    for (name, file) in &manifest {
        debug!(class = %name, path = %file.display(), "class data file");
    }
    build_dataset(&manifest, options)
}

pub fn build_dataset(manifest: &DatasetManifest, options: &DatasetLoadOptions) -> TrainingResult<ShowerDataset> {
    let mut per_layer: [Vec<Array3<f32>>; NUM_LAYERS] = Default::default();
    let mut energies = Vec::new();
    let mut labels = Vec::new();
    let mut class_names = Vec::new();
    let mut shapes: Option<[LayerShape; NUM_LAYERS]> = None;

    for (label, (name, file)) in manifest.iter().enumerate() {
        let class = read_class_file(file)?;
        let these = class.images.shapes();
        match shapes {
            None => shapes = Some(these),
            Some(expected) if expected != these => {
                return Err(TrainingError::Dataset(format!(
                    "layer sizes of class {name} ({these:?}) differ from earlier classes ({expected:?})"
                )));
            }
            Some(_) => {}
        }

        labels.push(Array1::from_elem(class.images.len(), label as u32));
        energies.push(class.energy);
        let [l0, l1, l2] = class.images.layers;
        per_layer[0].push(l0);
        per_layer[1].push(l1);
        per_layer[2].push(l2);
        class_names.push(name.clone());
    }

    let layers = per_layer.each_ref().map(|parts| {
        let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
        concatenate(Axis(0), &views)
    });
    let [l0, l1, l2] = layers;
    let images = ShowerImages::new([l0?, l1?, l2?].map(|l| l * options.image_scale))?;
    let energy = concatenate(Axis(0), &energies.iter().map(|e| e.view()).collect::<Vec<_>>())?;
    let labels = concatenate(Axis(0), &labels.iter().map(|l| l.view()).collect::<Vec<_>>())?;

    let dataset = ShowerDataset::new(images, energy, labels, class_names)?;
    if dataset.is_empty() {
        return Err(TrainingError::Dataset("dataset contains no events".to_string()));
    }
    Ok(match options.shuffle_seed {
        Some(seed) => dataset.shuffled(seed),
        None => dataset,
    })
}

struct ClassArrays {
    images: ShowerImages,
    energy: Array1<f32>,
}

fn read_class_file(path: &Path) -> TrainingResult<ClassArrays> {
    let file = File::open(path)
        .map_err(|e| TrainingError::Dataset(format!("failed to open data file {}: {e}", path.display())))?;
    let mut npz = NpzReader::new(file)?;

    let mut layers = Vec::with_capacity(NUM_LAYERS);
    for key in LAYER_KEYS {
        let array = read_named(&mut npz, key, path)?;
        layers.push(array.into_dimensionality::<Ix3>().map_err(|e| {
            TrainingError::Dataset(format!("{key} in {} must be [events, rows, cols]: {e}", path.display()))
        })?);
    }
    let energy = read_named(&mut npz, ENERGY_KEY, path)?;
    let energy: Array1<f32> = energy
        .into_shape_with_order(layers[0].len_of(Axis(0)))
        .map_err(|e| {
            TrainingError::Dataset(format!("energy in {} must hold one value per event: {e}", path.display()))
        })?;

    let [l0, l1, l2]: [Array3<f32>; NUM_LAYERS] = layers
        .try_into()
        .map_err(|_| TrainingError::Dataset(format!("{} is missing a layer", path.display())))?;
    Ok(ClassArrays { images: ShowerImages::new([l0, l1, l2])?, energy })
}

// numpy stores members as "<key>.npy"; writers that omit the suffix are accepted too.
fn read_named(npz: &mut NpzReader<File>, key: &str, path: &Path) -> TrainingResult<ArrayD<f32>> {
    match npz.by_name::<ndarray::OwnedRepr<f32>, ndarray::IxDyn>(&format!("{key}.npy")) {
        Ok(array) => Ok(array),
        Err(_) => npz.by_name(key).map_err(|e| {
            TrainingError::Dataset(format!("array {key} not readable in {}: {e}", path.display()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::NpzWriter;
    use tempfile::TempDir;

    fn write_class(path: &Path, events: usize, pixel: f32, energy: f32) {
        let mut npz = NpzWriter::new(File::create(path).unwrap());
        npz.add_array("layer_0", &Array3::<f32>::from_elem((events, 3, 96), pixel)).unwrap();
        npz.add_array("layer_1", &Array3::<f32>::from_elem((events, 12, 12), pixel)).unwrap();
        npz.add_array("layer_2", &Array3::<f32>::from_elem((events, 12, 6), pixel)).unwrap();
        npz.add_array("energy", &ndarray::Array2::<f32>::from_elem((events, 1), energy)).unwrap();
        npz.finish().unwrap();
    }

    #[test]
    fn test_load_dataset_from_manifest() {
        let temp = TempDir::new().unwrap();
        write_class(&temp.path().join("gamma.npz"), 3, 2000.0, 50.0);
        write_class(&temp.path().join("eplus.npz"), 5, 1000.0, 20.0);
        let manifest = temp.path().join("particles.yaml");
        std::fs::write(&manifest, "gamma: gamma.npz\neplus: eplus.npz\n").unwrap();

        let ds = load_dataset(&manifest, &DatasetLoadOptions::default()).unwrap();
        assert_eq!(ds.len(), 8);
        assert_eq!(ds.class_names(), &["eplus".to_string(), "gamma".to_string()]);
        assert_eq!(ds.layer_shapes(), [(3, 96), (12, 12), (12, 6)]);

        // eplus (label 0) pixels were 1000 MeV, gamma (label 1) 2000 MeV
        let batch = ds.batch(0, 8).unwrap();
        for i in 0..8 {
            let expected_pixel = if batch.labels[i] == 0 { 1.0 } else { 2.0 };
            let expected_energy = if batch.labels[i] == 0 { 20.0 } else { 50.0 };
            assert!((batch.images.layers[0][[i, 0, 0]] - expected_pixel).abs() < 1e-6);
            assert!((batch.energy[i] - expected_energy).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mismatched_layer_sizes_rejected() {
        let temp = TempDir::new().unwrap();
        write_class(&temp.path().join("a.npz"), 2, 1.0, 1.0);
        let mut npz = NpzWriter::new(File::create(temp.path().join("b.npz")).unwrap());
        npz.add_array("layer_0", &Array3::<f32>::zeros((2, 3, 48))).unwrap();
        npz.add_array("layer_1", &Array3::<f32>::zeros((2, 12, 12))).unwrap();
        npz.add_array("layer_2", &Array3::<f32>::zeros((2, 12, 6))).unwrap();
        npz.add_array("energy", &Array1::<f32>::zeros(2)).unwrap();
        npz.finish().unwrap();
        let manifest = temp.path().join("particles.yaml");
        std::fs::write(&manifest, "a: a.npz\nb: b.npz\n").unwrap();

        let err = load_dataset(&manifest, &DatasetLoadOptions::default()).unwrap_err();
        assert!(matches!(err, TrainingError::Dataset(_)));
    }

    #[test]
    fn test_missing_manifest_is_dataset_error() {
        let err = read_manifest(Path::new("/nonexistent/particles.yaml")).unwrap_err();
        assert!(matches!(err, TrainingError::Dataset(_)));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let temp = TempDir::new().unwrap();
        let manifest = temp.path().join("particles.yaml");
        std::fs::write(&manifest, "{}\n").unwrap();
        assert!(read_manifest(&manifest).is_err());
    }
}
