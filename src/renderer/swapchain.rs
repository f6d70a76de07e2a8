//! Swapchain management for video presentation.
//!
//! The swapchain is recreated on every resize and whenever the driver
//! reports it out of date; both surface as [`Error::SwapchainOutOfDate`]
//! so the playback loop can retry after resizing. Surface formats are
//! chosen from the source video's colorimetry: HDR transfers get a 10-bit
//! format when the surface offers one.

use ash::vk;
use log::debug;

use crate::color::ColorRepr;

use super::{error::Error, Device};

pub const FRAMES_IN_FLIGHT: usize = 2;
pub const DESIRED_SWAPCHAIN_LENGTH: u32 = 3;

/// Per-frame synchronization, cycled independently of the image count.
#[derive(Debug)]
pub struct FrameSync {
    pub acquire_semaphore: vk::Semaphore,
    pub present_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_views: Vec<vk::ImageView>,

    color: ColorRepr,
    current_frame: u64,
    current_image: Option<u32>,
    frame_sync: [FrameSync; FRAMES_IN_FLIGHT],
}

impl Swapchain {
    /// Wraps `surface` in a swapchain sized to `extent`. Takes ownership
    /// of the surface; it is released by [`Swapchain::destroy`].
    pub fn new(
        device: &Device,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        color: ColorRepr,
    ) -> Result<Self, Error> {
        let frame_sync = {
            let semaphore_info = vk::SemaphoreCreateInfo::builder();
            let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

            let mut sync = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for _ in 0..FRAMES_IN_FLIGHT {
                sync.push(unsafe {
                    FrameSync {
                        acquire_semaphore: device.device.create_semaphore(&semaphore_info, None)?,
                        present_semaphore: device.device.create_semaphore(&semaphore_info, None)?,
                        fence: device.device.create_fence(&fence_info, None)?,
                    }
                });
            }
            sync.try_into().expect("FRAMES_IN_FLIGHT elements")
        };

        let (handle, format, extent, image_views) =
            create_raw_swapchain(device, surface, extent, color, vk::SwapchainKHR::null())?;

        Ok(Self {
            handle,
            surface,
            format,
            extent,
            image_views,
            color,
            current_frame: 0,
            current_image: None,
            frame_sync,
        })
    }

    /// Recreates the swapchain for a new surface size. Must not be called
    /// with an image acquired.
    pub fn resize(&mut self, device: &Device, new_extent: vk::Extent2D) -> Result<(), Error> {
        assert_eq!(self.current_image, None);
        self.wait_idle(device)?;

        let (handle, format, extent, image_views) =
            create_raw_swapchain(device, self.surface, new_extent, self.color, self.handle)?;

        unsafe {
            device.swapchain_api.destroy_swapchain(self.handle, None);
            for view in self.image_views.drain(..) {
                device.device.destroy_image_view(view, None);
            }
        }

        self.handle = handle;
        self.format = format;
        self.extent = extent;
        self.image_views = image_views;

        Ok(())
    }

    pub fn destroy(mut self, device: &Device) -> Result<(), Error> {
        self.wait_idle(device)?;

        unsafe {
            for view in self.image_views.drain(..) {
                device.device.destroy_image_view(view, None);
            }
            for sync in &self.frame_sync {
                device.device.destroy_semaphore(sync.acquire_semaphore, None);
                device.device.destroy_semaphore(sync.present_semaphore, None);
                device.device.destroy_fence(sync.fence, None);
            }
            device.swapchain_api.destroy_swapchain(self.handle, None);
            device.surface_api.destroy_surface(self.surface, None);
        }

        Ok(())
    }

    pub fn frame_sync(&self) -> &FrameSync {
        &self.frame_sync[(self.current_frame % FRAMES_IN_FLIGHT as u64) as usize]
    }

    fn wait_idle(&self, device: &Device) -> Result<(), Error> {
        let fences: Vec<vk::Fence> = self.frame_sync.iter().map(|sync| sync.fence).collect();
        unsafe { device.device.wait_for_fences(&fences, true, u64::MAX) }?;
        Ok(())
    }

    /// Acquires the next image, waiting out the frame's fence first.
    /// Returns the image index; the caller renders into the matching view
    /// and then calls [`Swapchain::present`].
    pub fn acquire(&mut self, device: &Device) -> Result<u32, Error> {
        let sync = self.frame_sync();

        unsafe { device.device.wait_for_fences(&[sync.fence], true, u64::MAX) }?;

        let (index, suboptimal) = unsafe {
            device.swapchain_api.acquire_next_image(
                self.handle,
                u64::MAX,
                sync.acquire_semaphore,
                vk::Fence::null(),
            )
        }?;

        if suboptimal {
            return Err(Error::SwapchainOutOfDate);
        }

        unsafe { device.device.reset_fences(&[sync.fence]) }?;
        self.current_image = Some(index);
        Ok(index)
    }

    pub fn present(&mut self, device: &Device) -> Result<(), Error> {
        let sync = &self.frame_sync[(self.current_frame % FRAMES_IN_FLIGHT as u64) as usize];
        let image = self.current_image.take().expect("no image acquired");

        let wait_semaphores = [sync.present_semaphore];
        let swapchains = [self.handle];
        let image_indices = [image];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe {
            device
                .swapchain_api
                .queue_present(device.queue, &present_info)
        }?;

        self.current_frame += 1;

        if suboptimal {
            return Err(Error::SwapchainOutOfDate);
        }
        Ok(())
    }
}

fn create_raw_swapchain(
    device: &Device,
    surface: vk::SurfaceKHR,
    extent: vk::Extent2D,
    color: ColorRepr,
    old_swapchain: vk::SwapchainKHR,
) -> Result<
    (
        vk::SwapchainKHR,
        vk::SurfaceFormatKHR,
        vk::Extent2D,
        Vec<vk::ImageView>,
    ),
    Error,
> {
    let formats = unsafe {
        device
            .surface_api
            .get_physical_device_surface_formats(device.physical_device, surface)
    }?;
    let format = select_surface_format(&formats, color);
    debug!(
        "presenting as {:?} / {:?} for {} content",
        format.format,
        format.color_space,
        color.transfer.name()
    );

    let capabilities = unsafe {
        device
            .surface_api
            .get_physical_device_surface_capabilities(device.physical_device, surface)
    }?;

    let extent = if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    };

    let min_images = if capabilities.max_image_count == 0 {
        DESIRED_SWAPCHAIN_LENGTH.max(capabilities.min_image_count)
    } else {
        DESIRED_SWAPCHAIN_LENGTH.clamp(capabilities.min_image_count, capabilities.max_image_count)
    };

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(min_images)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        // FIFO is the only universally supported mode and the right one
        // for clocked video frames anyway.
        .present_mode(vk::PresentModeKHR::FIFO)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = unsafe { device.swapchain_api.create_swapchain(&create_info, None) }?;

    let images = unsafe { device.swapchain_api.get_swapchain_images(handle) }?;
    let mut image_views = Vec::with_capacity(images.len());
    for image in images {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        image_views.push(unsafe { device.device.create_image_view(&view_info, None) }?);
    }

    Ok((handle, format, extent, image_views))
}

/// Picks the surface format best matching the content's colorimetry: a
/// 10-bit format for HDR or wide-gamut sources when available, 8-bit UNORM
/// otherwise, the driver's first offer as a last resort.
fn select_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    color: ColorRepr,
) -> vk::SurfaceFormatKHR {
    let wants_deep = color.transfer.is_hdr() || color.primaries.is_wide_gamut();

    if wants_deep {
        let hdr10 = formats.iter().find(|f| {
            f.format == vk::Format::A2B10G10R10_UNORM_PACK32
                && f.color_space == vk::ColorSpaceKHR::HDR10_ST2084_EXT
        });
        let deep = formats
            .iter()
            .find(|f| f.format == vk::Format::A2B10G10R10_UNORM_PACK32);
        if let Some(format) = hdr10.or(deep) {
            return *format;
        }
    }

    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use crate::color::{ColorPrimaries, ColorSystem, ColorTransfer};

    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn sdr_prefers_8bit_unorm() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];

        let sdr = ColorRepr::default().guess_defaults();
        let chosen = select_surface_format(&formats, sdr);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn hdr_prefers_10bit_when_offered() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            ),
        ];

        let hdr = ColorRepr {
            system: ColorSystem::Bt2020Ncl,
            primaries: ColorPrimaries::Bt2020,
            transfer: ColorTransfer::Pq,
            ..Default::default()
        };
        let chosen = select_surface_format(&formats, hdr);
        assert_eq!(chosen.format, vk::Format::A2B10G10R10_UNORM_PACK32);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::HDR10_ST2084_EXT);

        // Without a 10-bit option, HDR content still presents as UNORM.
        let chosen = select_surface_format(&formats[..1], hdr);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }
}
