use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a compatible Vulkan driver was not found")]
    NoVulkanLibrary,
    #[error("no suitable GPU was found")]
    NoSuitableGpu,

    #[error("no device memory type matches property flags {0:?}")]
    NoMatchingMemoryType(vk::MemoryPropertyFlags),
    /// The driver rejected the heap's memory type for a buffer created on
    /// that heap. Indicates a memory-type selection bug, not a caller error.
    #[error("memory type {type_index} does not support buffer usage {usage:?}")]
    IncompatibleBufferUsage {
        type_index: u32,
        usage: vk::BufferUsageFlags,
    },

    #[error("the swapchain no longer matches the surface and must be recreated")]
    SwapchainOutOfDate,

    #[error("no usable SPIR-V compiler was found")]
    NoSpirvCompiler,
    #[error("shader compilation failed: {0}")]
    SpirvCompile(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Vulkan(#[from] vk::Result),
}
