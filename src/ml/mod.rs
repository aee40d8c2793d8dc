pub mod label_codec;
pub mod preprocess;
pub mod partition;
pub mod ml_model;
pub mod training;
pub mod inference;
pub mod evaluation;

pub use label_codec::LabelCodec;
pub use preprocess::{build_corpus, preprocess_bytes, preprocess_image, preprocess_path, GlyphCorpus, GlyphTensor, RESIZE_FILTER};
pub use partition::{partition, DatasetPartition, Fold, PartitionConfig};
pub use ml_model::{CharClassifier, ModelConfig, NUM_CLASSES, IMAGE_SIZE};
pub use training::{train_ensemble, train_fold, EarlyStopping, EarlyStoppingState, EnsembleTrainingReport, EpochProgress, GlyphDataset, TrainerConfig};
pub use inference::{EnsembleEngine, LoadPolicy};
pub use evaluation::{evaluate, ClassMetrics, EvaluationReport};
