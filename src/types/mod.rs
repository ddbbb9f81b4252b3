// Backend-agnostic value types shared by every device implementation

mod command;
mod format;
mod mapped;
mod param;
mod resource;
mod view;

pub use command::ComputeCommand;
pub use format::{Format, READBACK_PITCH_ALIGNMENT};
pub use mapped::MappedResource;
pub use param::{
    count_mips, BufferParam, SubresourceData, TextureParam, TextureShape, ViewFlags,
    CUBEMAP_NUM_FACES,
};
pub use resource::{
    BufferObject, CopyBufferParam, CopyTextureSubresourceParam,
    CopyTextureSubresourceToBufferParam, TextureObject,
};
pub use view::{
    cube_count, Sampler, SamplerState, ShaderResourceView, SrvKind, UavKind, UnorderedAccessView,
    ViewDesc, ViewDimension, ViewPlan,
};
