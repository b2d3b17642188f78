//! Device-dependent tests; run with `cargo test -- --ignored` on a machine
//! with a Vulkan 1.3 driver (and a display for the windowed ones).

use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use ash::vk;
use render_core::prelude::*;
use render_core::render::backends::vulkan::FrameState;

fn acquire_token() -> DeviceToken {
    loop {
        if let Some(token) = DeviceToken::acquire() {
            return token;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn headless_context() -> DeviceContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = DeviceConfig::new("render_core tests").with_validation(true);
    DeviceContext::new(acquire_token(), &config, None).expect("headless device context")
}

#[test]
#[ignore = "requires a Vulkan device"]
fn staged_upload_round_trips() {
    let mut ctx = headless_context();

    for size in [1usize, 4096, 4097] {
        let bytes: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        let mut buffer = GpuBuffer::new(
            &ctx,
            size as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryResidency::DeviceLocal,
        )
        .unwrap();

        buffer.write(&mut ctx, &bytes, 0).unwrap();
        let read = buffer.read_back(&mut ctx).unwrap();
        assert_eq!(read, bytes, "size {}", size);

        buffer.destroy(&ctx);
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn mapped_write_rejects_out_of_range() {
    let mut ctx = headless_context();
    let mut buffer = GpuBuffer::new(
        &ctx,
        64,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        MemoryResidency::HostRandomAccess,
    )
    .unwrap();

    assert!(buffer.write_mapped(&ctx, &[0u8; 16], 48).is_ok());
    assert!(buffer.write_mapped(&ctx, &[0u8; 16], 56).is_err());
    assert_eq!(&buffer.read_back(&mut ctx).unwrap()[48..64], &[0u8; 16]);

    buffer.destroy(&ctx);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn mip_chain_of_solid_color_is_that_color() {
    let mut ctx = headless_context();
    let color = [200u8, 100, 50, 255];
    let extent = vk::Extent2D { width: 256, height: 256 };

    let desc = ImageDesc::texture_2d(extent, vk::Format::R8G8B8A8_UNORM, true);
    assert_eq!(desc.mip_levels, 9);
    let image = GpuImage::new(&ctx, &desc).unwrap();

    let pixels = ImageData::solid_color(256, 256, color);
    StagedUpload::new(&mut ctx)
        .upload_image(&image, &pixels.data, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .unwrap();

    let last_level = desc.mip_levels - 1;
    let texel = StagedUpload::new(&mut ctx)
        .read_image_level(&image, last_level, 0, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .unwrap();
    assert_eq!(texel.len(), 4);
    for (got, want) in texel.iter().zip(color.iter()) {
        assert_abs_diff_eq!(f32::from(*got), f32::from(*want), epsilon = 1.0);
    }

    image.destroy(&ctx);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn managers_track_handles() {
    let mut ctx = headless_context();
    let mut meshes = MeshManager::new(2);
    let mut textures = TextureManager::new(4, 16.0);

    let quad = meshes.upload(&mut ctx, &MeshData::quad()).unwrap();
    assert_eq!(meshes.get(quad).unwrap().index_count(), 6);
    meshes.destroy(&ctx, quad).unwrap();
    assert!(meshes.get(quad).is_err());

    let white = textures.default_white(&mut ctx).unwrap();
    assert_eq!(textures.default_white(&mut ctx).unwrap(), white);

    let cross = ImageData::solid_color(64, 48, [0, 0, 255, 255]);
    let sky = textures.create_cubemap(&mut ctx, &cross, true).unwrap();
    assert_eq!(textures.get(sky).unwrap().image().desc().array_layers, 6);

    meshes.destroy_all(&ctx);
    textures.destroy_all(&ctx);
    assert!(textures.is_empty());
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn frame_pacer_reuses_slots_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut window = Window::new("pacer liveness", 320, 240).unwrap();
    let config = RenderCoreConfig::new("pacer liveness");
    let ctx = DeviceContext::new(acquire_token(), &config.device, Some(&mut window)).unwrap();
    let mut pacer = FramePacer::new(&ctx, &config.present, window.framebuffer_extent()).unwrap();
    let mut renderer = ClearRenderer::new([0.1, 0.2, 0.3, 1.0]);
    let meshes = MeshManager::new(1);

    let slots = pacer.frames_in_flight();
    let frames = 3 * slots + 1;
    let mut used = Vec::new();
    let mut resizes = 0;
    for _ in 0..frames {
        window.poll_events();
        let expected = pacer.ring().peek();
        let started = pacer.ring().frames_started();

        let frame = match pacer.begin_frame(&ctx) {
            Ok(frame) => frame,
            Err(VulkanError::InvalidWindow) => {
                resizes += 1;
                pacer.resize(&ctx, window.wait_for_valid_extent()).unwrap();
                continue;
            }
            Err(e) => panic!("begin_frame failed: {}", e),
        };
        // The slot is claimed only once its fence wait has succeeded
        assert_eq!(frame.slot(), expected);
        assert_eq!(pacer.ring().last_waited(), Some(expected));
        assert_eq!(pacer.ring().frames_started(), started + 1);
        assert_eq!(pacer.state(), FrameState::Recording);
        used.push(frame.slot());

        renderer.draw(&frame, &meshes).unwrap();
        match pacer.end_frame(frame) {
            Ok(()) => {}
            Err(VulkanError::InvalidWindow) => {
                resizes += 1;
                pacer.resize(&ctx, window.wait_for_valid_extent()).unwrap();
            }
            Err(e) => panic!("end_frame failed: {}", e),
        }
        assert_eq!(pacer.state(), FrameState::Idle);
    }

    if resizes == 0 {
        // Frame n + F waits on and reuses the slot of frame n
        let expected: Vec<usize> = (0..frames).map(|n| n % slots).collect();
        assert_eq!(used, expected);
    }
    assert!(used.len() >= frames - resizes);

    // Every submitted frame signals its slot fence
    ctx.wait_idle().unwrap();
    for slot in 0..slots {
        assert!(pacer.slot_fence_signalled(slot).unwrap(), "slot {}", slot);
    }

    renderer.destroy(&ctx);
    drop(pacer);
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn abandoned_frame_releases_its_slot() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut window = Window::new("abandon", 320, 240).unwrap();
    let config = RenderCoreConfig::new("abandon");
    let ctx = DeviceContext::new(acquire_token(), &config.device, Some(&mut window)).unwrap();
    let mut pacer = FramePacer::new(&ctx, &config.present, window.framebuffer_extent()).unwrap();
    let mut renderer = ClearRenderer::new([0.0, 0.0, 0.0, 1.0]);
    let meshes = MeshManager::new(1);

    let frame = pacer.begin_frame(&ctx).unwrap();
    let abandoned = frame.slot();
    pacer.abandon_frame(frame);
    assert_eq!(pacer.state(), FrameState::Idle);

    // The wait-only batch signals the fence, so the slot is reusable
    ctx.wait_idle().unwrap();
    assert!(pacer.slot_fence_signalled(abandoned).unwrap());

    for _ in 0..pacer.frames_in_flight() + 1 {
        window.poll_events();
        let frame = match pacer.begin_frame(&ctx) {
            Ok(frame) => frame,
            Err(VulkanError::InvalidWindow) => {
                pacer.resize(&ctx, window.wait_for_valid_extent()).unwrap();
                continue;
            }
            Err(e) => panic!("begin_frame failed: {}", e),
        };
        renderer.draw(&frame, &meshes).unwrap();
        match pacer.end_frame(frame) {
            Ok(()) => {}
            Err(VulkanError::InvalidWindow) => pacer.resize(&ctx, window.wait_for_valid_extent()).unwrap(),
            Err(e) => panic!("end_frame failed: {}", e),
        }
    }

    ctx.wait_idle().unwrap();
    renderer.destroy(&ctx);
    drop(pacer);
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn resize_recovers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut window = Window::new("resize recovery", 320, 240).unwrap();
    let mut engine = RenderEngine::new(&mut window, RenderCoreConfig::new("resize recovery")).unwrap();
    assert_eq!(engine.draw_frame(&mut window).unwrap(), FrameOutcome::Presented);
    let original = engine.pacer().window_extent();

    window.set_size(640, 360);
    // Window systems apply the new size asynchronously
    let deadline = Instant::now() + Duration::from_secs(2);
    while window.framebuffer_extent() == original && Instant::now() < deadline {
        window.poll_events();
        std::thread::sleep(Duration::from_millis(10));
    }
    let resized_to = window.framebuffer_extent();
    assert_ne!(resized_to, original);
    // 640x360 in window coordinates; the framebuffer may be scaled
    assert_eq!(resized_to.width * 360, resized_to.height * 640);

    let outcomes: Vec<FrameOutcome> = (0..4)
        .map(|_| {
            window.poll_events();
            engine.draw_frame(&mut window).unwrap()
        })
        .collect();

    assert_eq!(outcomes[0], FrameOutcome::Resized);
    assert_eq!(outcomes.iter().filter(|&&o| o == FrameOutcome::Resized).count(), 1, "{:?}", outcomes);
    assert!(outcomes[1..].iter().all(|&o| o == FrameOutcome::Presented), "{:?}", outcomes);
    assert_eq!(engine.pacer().window_extent(), resized_to);
    assert_eq!(engine.extent(), resized_to);
    assert_eq!(engine.pacer().state(), FrameState::Idle);
}
