//! Vulkan context management
//!
//! [`DeviceContext`] is the single connection to one GPU: instance, optional
//! presentation surface, logical device, queue, memory allocator, command
//! pools and the scratch arena. Construction consumes a [`DeviceToken`], and
//! at most one token exists per process at a time.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::surface::{PresentationSurface, SurfaceProvider};
use crate::core::{DeviceConfig, PresentConfig};
use crate::foundation::Arena;
use crate::render::backends::vulkan::rendering::commands::{CommandPool, OneShotCommands};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &str = "render_core";

static DEVICE_ISSUED: AtomicBool = AtomicBool::new(false);

/// Capability to create the process's one [`DeviceContext`]
///
/// Returned by [`DeviceToken::acquire`] at most once until it is dropped
/// (directly or together with the context that consumed it).
#[derive(Debug)]
pub struct DeviceToken {
    _private: (),
}

impl DeviceToken {
    /// Take the token if no other holder exists
    pub fn acquire() -> Option<Self> {
        DEVICE_ISSUED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { _private: () })
    }
}

impl Drop for DeviceToken {
    fn drop(&mut self) {
        DEVICE_ISSUED.store(false, Ordering::Release);
    }
}

/// Vulkan instance wrapper with RAII cleanup
struct VulkanInstance {
    entry: Entry,
    instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    fn new(config: &DeviceConfig, provider: Option<&dyn SurfaceProvider>) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let loader_version = entry.try_enumerate_instance_version()?.unwrap_or(vk::API_VERSION_1_0);
        if loader_version < vk::API_VERSION_1_3 {
            return Err(VulkanError::NoCompatibleDevice(format!(
                "Vulkan 1.3 required, loader supports {}.{}",
                vk::api_version_major(loader_version),
                vk::api_version_minor(loader_version)
            )));
        }

        let app_name = to_cstring(&config.application_name)?;
        let engine_name = to_cstring(ENGINE_NAME)?;
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = match provider {
            Some(provider) => provider.required_instance_extensions()?,
            None => Vec::new(),
        };

        let validation = config.validation_enabled() && Self::validation_layer_available(&entry)?;
        if config.validation_enabled() && !validation {
            log::warn!("{} not installed, continuing without validation", VALIDATION_LAYER);
        }
        if validation {
            extensions.push(DebugUtils::name().to_owned());
        }

        let available = entry.enumerate_instance_extension_properties(None)?;
        for required in &extensions {
            let supported = available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == required.as_c_str());
            if !supported {
                return Err(VulkanError::ExtensionUnavailable(required.to_string_lossy().into_owned()));
            }
        }

        let extension_ptrs: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();
        let layer_names = if validation { vec![to_cstring(VALIDATION_LAYER)?] } else { Vec::new() };
        let layer_ptrs: Vec<_> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let mut this = Self {
            entry,
            instance,
            debug_utils: None,
        };

        if validation {
            let debug_utils = DebugUtils::new(&this.entry, &this.instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            this.debug_utils = Some((debug_utils, messenger));
            log::debug!("Validation enabled");
        }

        Ok(this)
    }

    fn validation_layer_available(entry: &Entry) -> VulkanResult<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        Ok(layers.iter().any(|layer| {
            unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_bytes() == VALIDATION_LAYER.as_bytes()
        }))
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
        Ok(messenger)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::trace!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

fn to_cstring(s: &str) -> VulkanResult<CString> {
    CString::new(s).map_err(|e| VulkanError::InitializationFailed(format!("Invalid name {:?}: {}", s, e)))
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Index of the graphics + compute (+ present) queue family
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Device name as reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Select the best suitable physical device
    ///
    /// Discrete GPUs rank above integrated ones when `prefer_discrete` is set.
    /// When nothing qualifies, the rejection that got furthest through the
    /// checks is reported.
    pub fn select_suitable_device(
        instance: &Instance,
        surface: Option<&PresentationSurface>,
        prefer_discrete: bool,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices()? };
        if devices.is_empty() {
            return Err(VulkanError::NoCompatibleDevice("No Vulkan devices found".to_string()));
        }

        let mut best: Option<(u32, Self)> = None;
        let mut rejection: Option<VulkanError> = None;

        for device in devices {
            match Self::evaluate_device(instance, device, surface) {
                Ok(info) => {
                    let score = if prefer_discrete { device_type_score(info.properties.device_type) } else { 0 };
                    log::debug!("GPU candidate {} (score {})", info.name(), score);
                    if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                        best = Some((score, info));
                    }
                }
                Err(e) => {
                    log::debug!("Rejected GPU: {}", e);
                    if rejection.as_ref().map_or(true, |prev| rejection_depth(&e) >= rejection_depth(prev)) {
                        rejection = Some(e);
                    }
                }
            }
        }

        match best {
            Some((_, info)) => {
                log::info!("Selected GPU: {}", info.name());
                Ok(info)
            }
            None => Err(rejection
                .unwrap_or_else(|| VulkanError::NoCompatibleDevice("No suitable GPU found".to_string()))),
        }
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<&PresentationSurface>,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            return Err(VulkanError::NoCompatibleDevice(format!(
                "device supports Vulkan {}.{} only",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version)
            )));
        }

        let extensions = unsafe { instance.enumerate_device_extension_properties(device)? };
        let required_extensions = [SwapchainLoader::name()];
        for required in required_extensions {
            let supported = extensions
                .iter()
                .any(|available| unsafe { CStr::from_ptr(available.extension_name.as_ptr()) } == required);
            if !supported {
                return Err(VulkanError::ExtensionUnavailable(required.to_string_lossy().into_owned()));
            }
        }

        let features = unsafe { instance.get_physical_device_features(device) };
        if features.sampler_anisotropy != vk::TRUE {
            return Err(VulkanError::FeatureUnavailable("samplerAnisotropy"));
        }
        if features.sample_rate_shading != vk::TRUE {
            return Err(VulkanError::FeatureUnavailable("sampleRateShading"));
        }

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
        }
        if features13.synchronization2 != vk::TRUE {
            return Err(VulkanError::FeatureUnavailable("synchronization2"));
        }
        if features13.dynamic_rendering != vk::TRUE {
            return Err(VulkanError::FeatureUnavailable("dynamicRendering"));
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut queue_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if !family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            {
                continue;
            }
            let present_ok = match surface {
                Some(surface) => surface.supports_present(device, index)?,
                None => true,
            };
            if present_ok {
                queue_family = Some(index);
                break;
            }
        }
        let queue_family = queue_family.ok_or(VulkanError::QueueFamilyUnavailable)?;

        Ok(Self {
            device,
            properties,
            queue_family,
        })
    }
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 2,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        _ => 0,
    }
}

// Order in which evaluate_device runs its checks
fn rejection_depth(error: &VulkanError) -> u8 {
    match error {
        VulkanError::NoCompatibleDevice(_) => 0,
        VulkanError::ExtensionUnavailable(_) => 1,
        VulkanError::FeatureUnavailable(_) => 2,
        VulkanError::QueueFamilyUnavailable => 3,
        _ => 0,
    }
}

fn create_logical_device(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Device> {
    let priorities = [1.0_f32];
    let queue_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(physical.queue_family)
        .queue_priorities(&priorities)
        .build();

    let required_extensions = [SwapchainLoader::name().as_ptr()];

    let device_features = vk::PhysicalDeviceFeatures::builder()
        .sampler_anisotropy(true)
        .sample_rate_shading(true)
        .build();

    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .synchronization2(true)
        .dynamic_rendering(true)
        .build();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&required_extensions)
        .enabled_features(&device_features)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(physical.device, &create_info, None)? };
    Ok(device)
}

/// The connection to one GPU
///
/// Fields are torn down in reverse creation order by [`Drop`]; resources
/// created from the context must be destroyed before it.
pub struct DeviceContext {
    scratch: Arena,
    transient_pool: CommandPool,
    command_pool: CommandPool,
    allocator: Option<vk_mem::Allocator>,
    device: Device,
    queue: vk::Queue,
    physical: PhysicalDeviceInfo,
    surface: Option<PresentationSurface>,
    transfer_timeout: Duration,
    instance: VulkanInstance,
    _token: DeviceToken,
}

impl DeviceContext {
    /// Create the context
    ///
    /// With a `provider` the instance enables the window system's surface
    /// extensions and a presentation surface is created; without one the
    /// context is headless. Anything created before a failure is released.
    pub fn new(
        token: DeviceToken,
        config: &DeviceConfig,
        provider: Option<&mut dyn SurfaceProvider>,
    ) -> VulkanResult<Self> {
        log::info!("Creating device context for '{}'", config.application_name);

        let instance = VulkanInstance::new(config, provider.as_deref())?;

        let mut surface = match provider {
            Some(provider) => Some(PresentationSurface::new(&instance.entry, &instance.instance, provider)?),
            None => None,
        };

        let physical = match PhysicalDeviceInfo::select_suitable_device(
            &instance.instance,
            surface.as_ref(),
            config.prefer_discrete_gpu,
        ) {
            Ok(physical) => physical,
            Err(e) => {
                if let Some(surface) = surface.as_mut() {
                    unsafe { surface.destroy() };
                }
                return Err(e);
            }
        };

        let device = match create_logical_device(&instance.instance, &physical) {
            Ok(device) => device,
            Err(e) => {
                if let Some(surface) = surface.as_mut() {
                    unsafe { surface.destroy() };
                }
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(physical.queue_family, 0) };

        // From here on, Drop handles partial construction
        let mut context = Self {
            scratch: Arena::new(0),
            transient_pool: CommandPool::null(),
            command_pool: CommandPool::null(),
            allocator: None,
            device,
            queue,
            physical,
            surface,
            transfer_timeout: PresentConfig::default().frame_timeout(),
            instance,
            _token: token,
        };

        let allocator_info = vk_mem::AllocatorCreateInfo::new(
            &context.instance.instance,
            &context.device,
            context.physical.device,
        )
        .vulkan_api_version(vk::API_VERSION_1_3);
        #[allow(unused_unsafe)]
        let allocator = unsafe { vk_mem::Allocator::new(allocator_info)? };
        context.allocator = Some(allocator);

        context.command_pool = CommandPool::new(
            &context.device,
            context.physical.queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        context.transient_pool = CommandPool::new(
            &context.device,
            context.physical.queue_family,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;

        context.scratch = Arena::new(crate::core::ResourceLimits::default().scratch_arena_bytes);

        log::info!(
            "Device context ready on {} (queue family {})",
            context.physical.name(),
            context.physical.queue_family
        );
        Ok(context)
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Vulkan entry point
    pub fn entry(&self) -> &Entry {
        &self.instance.entry
    }

    /// Selected physical device
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// The graphics + compute queue
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Queue family index of [`queue`](Self::queue)
    pub fn queue_family(&self) -> u32 {
        self.physical.queue_family
    }

    /// GPU memory allocator
    pub fn allocator(&self) -> &vk_mem::Allocator {
        // Only None between construction steps or during teardown
        match self.allocator.as_ref() {
            Some(allocator) => allocator,
            None => unreachable!("allocator used outside the context's lifetime"),
        }
    }

    /// Pool for per-frame command buffers that are reset and re-recorded
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Scratch arena for short-lived per-call data
    pub fn scratch(&self) -> &Arena {
        &self.scratch
    }

    /// Presentation surface, if the context was created with a window
    pub fn surface(&self) -> Option<&PresentationSurface> {
        self.surface.as_ref()
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Record commands into a transient buffer, submit and wait for completion
    ///
    /// Exclusive access keeps blocking transfers out of a frame that is being
    /// recorded; `record` gets a shared view of the context back. The command
    /// buffer is freed whether recording or submission fails, and a wait
    /// longer than [`transfer_timeout`](Self::transfer_timeout) returns
    /// `FrameTimeout`.
    pub(crate) fn one_shot<F>(&mut self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&DeviceContext, vk::CommandBuffer) -> VulkanResult<()>,
    {
        let ctx: &DeviceContext = self;
        let commands = OneShotCommands::begin(&ctx.device, &ctx.transient_pool)?;
        record(ctx, commands.command_buffer())?;
        commands.submit_and_wait(ctx.queue, ctx.transfer_timeout)
    }

    /// Bound on the wait for blocking transfers
    pub fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout
    }

    /// Set the bound on the wait for blocking transfers
    pub fn set_transfer_timeout(&mut self, timeout: Duration) {
        self.transfer_timeout = timeout;
    }

    /// Format capabilities on the selected device
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical.device, format)
        }
    }

    /// Device limit for sampler anisotropy
    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.physical.properties.limits.max_sampler_anisotropy
    }

    /// Replace the scratch arena with one of `capacity` bytes
    ///
    /// Takes `&mut self`, so no scratch allocation can be outstanding.
    pub fn resize_scratch(&mut self, capacity: usize) {
        self.scratch = Arena::new(capacity);
    }

    /// Explicit teardown; equivalent to dropping the context
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::debug!("Destroying device context");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed during teardown: {:?}", e);
            }

            self.scratch = Arena::new(0);
            self.transient_pool.destroy(&self.device);
            self.command_pool.destroy(&self.device);
            drop(self.allocator.take());
            self.device.destroy_device(None);
            if let Some(surface) = self.surface.as_mut() {
                surface.destroy();
            }
        }
        // `instance` (debug messenger, then instance) and the token drop next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    // Tests that take the process-wide token run one at a time
    static TOKEN_HOLDERS: Mutex<()> = Mutex::new(());

    #[test]
    fn test_device_token_is_exclusive() {
        let _serial = TOKEN_HOLDERS.lock().unwrap_or_else(|e| e.into_inner());
        let first = DeviceToken::acquire().expect("no other token in this test binary");
        assert!(DeviceToken::acquire().is_none());
        drop(first);

        let second = DeviceToken::acquire();
        assert!(second.is_some());
    }

    #[test]
    fn test_device_type_ranking() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_score(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn test_most_specific_rejection_wins() {
        assert!(
            rejection_depth(&VulkanError::QueueFamilyUnavailable)
                > rejection_depth(&VulkanError::FeatureUnavailable("synchronization2"))
        );
        assert!(
            rejection_depth(&VulkanError::FeatureUnavailable("dynamicRendering"))
                > rejection_depth(&VulkanError::ExtensionUnavailable("VK_KHR_swapchain".into()))
        );
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn test_hung_transfer_times_out() {
        let _serial = TOKEN_HOLDERS.lock().unwrap_or_else(|e| e.into_inner());
        let token = DeviceToken::acquire().unwrap();
        let config = DeviceConfig::new("render_core transfer timeout");
        let mut ctx = DeviceContext::new(token, &config, None).unwrap();
        ctx.set_transfer_timeout(Duration::from_millis(50));

        let event = unsafe {
            ctx.device()
                .create_event(&vk::EventCreateInfo::default(), None)
                .unwrap()
        };

        // The GPU waits on an event only the host sets, after the timeout
        let result = ctx.one_shot(|ctx, cmd| {
            unsafe {
                ctx.device().cmd_wait_events(
                    cmd,
                    &[event],
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    &[],
                    &[],
                    &[],
                );
            }
            Ok(())
        });
        assert!(matches!(result, Err(VulkanError::FrameTimeout)), "{:?}", result);

        unsafe { ctx.device().set_event(event).unwrap() };
        ctx.wait_idle().unwrap();
        unsafe { ctx.device().destroy_event(event, None) };

        // A transfer that completes still succeeds afterwards
        ctx.set_transfer_timeout(Duration::from_secs(1));
        assert!(ctx.one_shot(|_, _| Ok(())).is_ok());
    }
}
