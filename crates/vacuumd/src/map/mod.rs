pub mod builder;
pub mod codec;
pub mod render;

pub use builder::build_device_maps;
pub use builder::BuilderError;
pub use builder::SETTLE_INTERVAL;
pub use codec::Drawable;
pub use codec::GridMapCodec;
pub use codec::MapCodec;
pub use render::MapRenderer;
pub use render::RenderError;
pub use render::CACHE_INTERVAL;
