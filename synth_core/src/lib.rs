//! Speech synthesis core: the model seam, the Chatterbox Multilingual ONNX
//! backend, text preparation, token sampling and WAV handling.

pub mod chatterbox;
pub mod model;
pub mod sampling;
pub mod text;
pub mod wav;

pub use chatterbox::{ChatterboxConfig, ChatterboxModel, Device, S3GEN_SAMPLE_RATE};
pub use model::{GenerateOptions, SpeechModel, Waveform};
pub use sampling::SamplingConfig;
pub use text::{is_supported_language, language_name, SUPPORTED_LANGUAGES};
pub use wav::{encode_wav, read_audio, AudioError};
