pub mod livekit;
pub mod voice;
pub mod streaming;
pub mod storage;

pub use storage::{Storage, LocalStorage, StorageManager, StorageConfig, StoredFile, P2PTransferRequest};
pub use livekit::{LiveKitConfig, AudioBitrate, WebhookEvent};
pub use voice::{VoiceManager, VoiceJoinResponse, StreamStartResponse};
pub use streaming::{StreamConfig, StreamQualityPreset, SimulcastLayer, StreamMetadata, ViewerQuality, ScreenCaptureConfig};
