//! Vulkan renderer plumbing: device bring-up, the memory suballocator,
//! shader compilation and swapchain management.

mod error;
pub mod memory;
pub mod spirv;
pub mod swapchain;

use std::ffi::{c_void, CStr};
use std::ptr::NonNull;

use ash::vk;
use log::debug;
use once_cell::sync::Lazy;

pub use error::Error;
pub use memory::{BufferSlice, DeviceAllocator, MemoryDevice, MemorySlice, MemoryTypeInfo};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

const SURFACE_EXTENSION: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_surface\0") };

// Window-system surface extensions, enabled opportunistically when
// presentation is requested.
const PLATFORM_SURFACE_EXTENSIONS: &[&CStr] = unsafe {
    &[
        CStr::from_bytes_with_nul_unchecked(b"VK_KHR_xcb_surface\0"),
        CStr::from_bytes_with_nul_unchecked(b"VK_KHR_xlib_surface\0"),
        CStr::from_bytes_with_nul_unchecked(b"VK_KHR_wayland_surface\0"),
        CStr::from_bytes_with_nul_unchecked(b"VK_KHR_win32_surface\0"),
    ]
};

const SWAPCHAIN_EXTENSION: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_swapchain\0") };

static VULKAN_ENTRY: Lazy<Option<ash::Entry>> = Lazy::new(|| unsafe { ash::Entry::load().ok() });

/// The renderer's handle to one GPU: instance, logical device and the
/// queries the suballocator and swapchain need.
pub struct Device {
    instance: ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub queue: vk::Queue,

    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,

    pub surface_api: ash::extensions::khr::Surface,
    pub swapchain_api: ash::extensions::khr::Swapchain,
}

impl Device {
    /// Brings up an instance and logical device on the first GPU with a
    /// graphics queue, preferring discrete GPUs. With `presentation`, the
    /// surface and swapchain extensions are enabled so [`swapchain`] can
    /// be used.
    pub fn new(presentation: bool) -> Result<Self, Error> {
        let entry = VULKAN_ENTRY.as_ref().ok_or(Error::NoVulkanLibrary)?;

        let instance = {
            let mut layers: Vec<*const i8> = Vec::new();
            #[cfg(debug_assertions)]
            {
                let available = entry.enumerate_instance_layer_properties()?;
                if available.iter().any(|layer| {
                    (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
                }) {
                    layers.push(VALIDATION_LAYER.as_ptr());
                }
            }

            let mut extensions: Vec<*const i8> = Vec::new();
            if presentation {
                let available = entry.enumerate_instance_extension_properties(None)?;
                let has = |name: &CStr| {
                    available.iter().any(|ext| {
                        (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == name
                    })
                };

                if !has(SURFACE_EXTENSION) {
                    return Err(Error::NoSuitableGpu);
                }
                extensions.push(SURFACE_EXTENSION.as_ptr());
                for &ext in PLATFORM_SURFACE_EXTENSIONS {
                    if has(ext) {
                        extensions.push(ext.as_ptr());
                    }
                }
            }

            let app_info =
                vk::ApplicationInfo::builder().api_version(vk::make_api_version(0, 1, 1, 0));
            let create_info = vk::InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_layer_names(&layers)
                .enabled_extension_names(&extensions);

            unsafe { entry.create_instance(&create_info, None) }?
        };

        let (physical_device, queue_family) = match select_gpu(&instance) {
            Some(selected) => selected,
            None => {
                unsafe { instance.destroy_instance(None) };
                return Err(Error::NoSuitableGpu);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        debug!("rendering on {:?}", unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
        });

        let device = {
            let queue_priority = [1.0];
            let queue_info = [vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priority)
                .build()];

            let mut extensions: Vec<*const i8> = Vec::new();
            if presentation {
                extensions.push(SWAPCHAIN_EXTENSION.as_ptr());
            }

            let create_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&queue_info)
                .enabled_extension_names(&extensions);

            match unsafe { instance.create_device(physical_device, &create_info, None) } {
                Ok(device) => device,
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let surface_api = ash::extensions::khr::Surface::new(entry, &instance);
        let swapchain_api = ash::extensions::khr::Swapchain::new(&instance, &device);

        Ok(Self {
            instance,
            device,
            physical_device,
            queue_family,
            queue,
            memory_properties,
            limits: properties.limits,
            surface_api,
            swapchain_api,
        })
    }

    /// Destroys the logical device and instance. Everything created from
    /// the device (allocator slices included) must already be gone.
    pub fn destroy(self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn select_gpu(instance: &ash::Instance) -> Option<(vk::PhysicalDevice, u32)> {
    let gpus = unsafe { instance.enumerate_physical_devices() }.ok()?;

    let mut fallback = None;
    for gpu in gpus {
        let families = unsafe { instance.get_physical_device_queue_family_properties(gpu) };
        let graphics = families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS));

        let Some(family) = graphics else { continue };
        let family = family as u32;

        let properties = unsafe { instance.get_physical_device_properties(gpu) };
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            return Some((gpu, family));
        }
        fallback = fallback.or(Some((gpu, family)));
    }

    fallback
}

impl MemoryDevice for Device {
    fn memory_types(&self) -> Vec<MemoryTypeInfo> {
        (0..self.memory_properties.memory_type_count)
            .map(|index| {
                let ty = self.memory_properties.memory_types[index as usize];
                MemoryTypeInfo {
                    index,
                    heap_index: ty.heap_index,
                    flags: ty.property_flags,
                }
            })
            .collect()
    }

    fn buffer_image_granularity(&self) -> vk::DeviceSize {
        self.limits.buffer_image_granularity
    }

    fn allocate_memory(
        &self,
        type_index: u32,
        size: vk::DeviceSize,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_index);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<(vk::Buffer, vk::MemoryRequirements), vk::Result> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        Ok((buffer, requirements))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn bind_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<(), vk::Result> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, vk::Result> {
        let pointer = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;
        NonNull::new(pointer).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }
}
