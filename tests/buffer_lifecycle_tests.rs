//! Integration tests for render buffer creation and destruction.
//!
//! These tests drive a full session over the virtual framebuffer and check
//! which buffers share the drawable's surface, which allocate, and that
//! every reference taken is given back.

use mali_accel::prelude::*;

fn session(config: DriverConfig, yres_virtual: u32) -> (Driver, Drawable) {
    let mut driver = Driver::virtual_screen(128, 64, yres_virtual, 32, config).unwrap();
    driver.create_screen_surface().unwrap();
    let window = driver.screen_window().unwrap();
    (driver, window)
}

fn refcnt(driver: &Driver, id: SurfaceId) -> u32 {
    driver.accel().surface(id).unwrap().refcnt()
}

// ============================================================================
// Front Buffers
// ============================================================================

/// Test that the front buffer shares the drawable's surface.
#[test]
fn test_front_buffer_never_allocates() {
    for config in [DriverConfig::default(), DriverConfig::flipping()] {
        let (mut driver, window) = session(config, 128);
        let surfaces = driver.accel().surfaces().len();
        let live = driver.accel().ump().stats().live();

        let front = driver
            .create_buffer(&window, Attachment::FrontLeft, 0)
            .unwrap();

        assert_eq!(front.surface(), window.surface);
        assert!(!front.owns_surface());
        assert_eq!(driver.accel().surfaces().len(), surfaces);
        assert_eq!(driver.accel().ump().stats().live(), live);
        assert_eq!(refcnt(&driver, window.surface), 2);

        driver.destroy_buffer(&window, Some(front));
    }
}

/// Test that two front buffers for the same drawable give their references back.
#[test]
fn test_front_buffer_references_balance() {
    let (mut driver, window) = session(DriverConfig::default(), 128);
    let before = refcnt(&driver, window.surface);

    let a = driver
        .create_buffer(&window, Attachment::FrontLeft, 0)
        .unwrap();
    let b = driver
        .create_buffer(&window, Attachment::FrontLeft, 0)
        .unwrap();
    assert_eq!(refcnt(&driver, window.surface), before + 2);

    driver.destroy_buffer(&window, Some(a));
    driver.destroy_buffer(&window, Some(b));
    assert_eq!(refcnt(&driver, window.surface), before);
}

// ============================================================================
// Back Buffers
// ============================================================================

/// Test that without flipping every back buffer is a new offscreen surface.
#[test]
fn test_back_buffer_allocates_without_flipping() {
    let (mut driver, window) = session(DriverConfig::default(), 128);

    let a = driver
        .create_buffer(&window, Attachment::BackLeft, 0)
        .unwrap();
    let b = driver
        .create_buffer(&window, Attachment::BackLeft, 0)
        .unwrap();

    assert!(a.owns_surface() && b.owns_surface());
    assert_ne!(a.surface(), b.surface());
    assert_ne!(a.name, b.name);
    assert_eq!(a.flags, 0);
    assert_eq!(a.pitch, 512);
    assert_eq!(a.cpp, 4);
    assert_eq!(driver.accel().surfaces().len(), 3);

    let storage = driver.accel().surface(a.surface()).unwrap().storage();
    assert!(storage.gpu_access());
    assert_eq!(storage.record().unwrap().byte_size(), 512 * 64);

    driver.destroy_buffer(&window, Some(a));
    driver.destroy_buffer(&window, Some(b));
    assert_eq!(driver.accel().surfaces().len(), 1);
    // Only the framebuffer is still held.
    assert_eq!(driver.accel().ump().stats().live(), 1);
}

/// Test that an offscreen buffer the CPU has drawn into is cleaned before sharing.
#[test]
fn test_offscreen_buffer_is_clean_for_gpu() {
    let (mut driver, window) = session(DriverConfig::default(), 128);
    let back = driver
        .create_buffer(&window, Attachment::BackLeft, 0)
        .unwrap();

    let accel = driver.accel_mut();
    accel.access(back.surface()).unwrap().as_mut_slice().fill(0x7f);
    let cleans = accel.ump().stats().cleans;
    // The window closed with gpu_access set, so it was cleaned on finish.
    assert!(cleans >= 1);

    driver.destroy_buffer(&window, Some(back));
}

/// Test that flip-eligible back buffers fail cleanly on a single-page display.
#[test]
fn test_flip_back_buffer_needs_two_pages() {
    let (mut driver, window) = session(DriverConfig::flipping(), 100);
    let surfaces = driver.accel().surfaces().len();
    let live = driver.accel().ump().stats().live();

    let err = driver
        .create_buffer(&window, Attachment::BackLeft, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Geometry {
            needed: 128,
            available: 100
        }
    ));

    assert_eq!(driver.accel().surfaces().len(), surfaces);
    assert_eq!(driver.accel().ump().stats().live(), live);
    assert_eq!(refcnt(&driver, window.surface), 1);
    assert_eq!(driver.geometry().y_offset(), 0);
}

/// Test that pixmaps never take the flip path.
#[test]
fn test_pixmap_back_buffer_is_offscreen() {
    let (mut driver, _window) = session(DriverConfig::flipping(), 128);
    let pixmap = driver.accel_mut().create_surface(32, 32, 24).unwrap();
    let drawable = Drawable::pixmap(pixmap, 32, 32, 24);

    let back = driver
        .create_buffer(&drawable, Attachment::BackLeft, 0)
        .unwrap();
    assert!(!back.is_page_flipped());
    assert!(back.owns_surface());
    assert_eq!(back.pitch, 128);
    assert_eq!(driver.geometry().y_offset(), 0);

    driver.destroy_buffer(&drawable, Some(back));
    driver.accel_mut().destroy_surface(pixmap);
    assert_eq!(driver.accel().surfaces().len(), 1);
}

/// Test that the server can veto flipping for a window.
#[test]
fn test_server_veto_disables_flip() {
    let backend = std::rc::Rc::new(MemfdBackend::new());
    let device = VirtualFramebuffer::new(&backend, 128, 64, 128, 32).unwrap();
    let mut driver = Driver::open(
        std::rc::Rc::new(device),
        backend,
        SoftwareServer::default(),
        DriverConfig::flipping(),
    )
    .unwrap();
    driver.create_screen_surface().unwrap();
    let window = driver.screen_window().unwrap();

    let back = driver
        .create_buffer(&window, Attachment::BackLeft, 0)
        .unwrap();
    assert!(!back.is_page_flipped());
    assert!(back.owns_surface());
    driver.destroy_buffer(&window, Some(back));
}

// ============================================================================
// Batched Creation
// ============================================================================

/// Test that batched creation returns one buffer per attachment, in order.
#[test]
fn test_create_buffers_batch() {
    let (mut driver, window) = session(DriverConfig::default(), 128);
    let attachments = [
        Attachment::FrontLeft,
        Attachment::BackLeft,
        Attachment::DepthStencil,
    ];

    let buffers = driver.create_buffers(&window, &attachments).unwrap();
    let got: Vec<_> = buffers.iter().map(|b| b.attachment).collect();
    assert_eq!(got, attachments);
    assert_eq!(driver.accel().surfaces().len(), 3);

    driver.destroy_buffers(&window, buffers);
    assert_eq!(driver.accel().surfaces().len(), 1);
    assert_eq!(refcnt(&driver, window.surface), 1);
}
