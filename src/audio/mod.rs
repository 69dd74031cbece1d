pub mod buffer;
pub mod playback;
pub mod resampler;
pub mod ring_buffer;
pub mod wav;

pub use buffer::AudioBuffer;
pub use playback::{
    get_output_device, list_output_devices, select_output_config, OutputDevice, Playback,
    PlaybackEngine,
};
pub use resampler::{StreamResampler, RESAMPLER_CHUNK};
pub use ring_buffer::RingBuffer;
pub use wav::{read_wav, write_wav};
