use std::sync::Arc;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::capture::MediaHandle;

pub const DEFAULT_WIDTH: f64 = 1280.0;
pub const DEFAULT_HEIGHT: f64 = 720.0;
pub const DOCKED_WIDTH: f64 = 250.0;
pub const DOCKED_HEIGHT: f64 = 150.0;
pub const DOCK_MARGIN: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Where the camera renders on the composed surface. Full-surface when
/// undocked; a draggable picture-in-picture tile when docked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPlacement {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub is_docked: bool,
}

impl CameraPlacement {
    fn full(width: f64, height: f64) -> Self {
        CameraPlacement {
            x: 0.0,
            y: 0.0,
            width,
            height,
            is_docked: false,
        }
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }
}

/// Renders the camera over the screen per the placement. Implemented by the
/// platform (canvas, GPU surface); tests use a passthrough.
pub trait Surface: Send + Sync {
    fn compose(
        &self,
        camera: &Arc<MediaHandle>,
        screen: &Arc<MediaHandle>,
        placement: CameraPlacement,
    ) -> Arc<MediaHandle>;
}

struct DragState {
    offset_x: f64,
    offset_y: f64,
}

/// Broadcaster-only composition: tracks output dimensions and the camera's
/// picture-in-picture placement, and selects the output handle fed into the
/// recording pipeline. Compositing is bypassed with a single active source.
pub struct Compositor {
    surface: Box<dyn Surface>,
    dimensions: Mutex<(f64, f64)>,
    placement: Mutex<CameraPlacement>,
    drag: Mutex<Option<DragState>>,
}

impl Compositor {
    pub fn new(surface: Box<dyn Surface>) -> Self {
        Compositor {
            surface,
            dimensions: Mutex::new((DEFAULT_WIDTH, DEFAULT_HEIGHT)),
            placement: Mutex::new(CameraPlacement::full(DEFAULT_WIDTH, DEFAULT_HEIGHT)),
            drag: Mutex::new(None),
        }
    }

    pub fn dimensions(&self) -> (f64, f64) {
        *self.dimensions.lock().unwrap()
    }

    pub fn set_dimensions(&self, width: f64, height: f64) {
        *self.dimensions.lock().unwrap() = (width, height);
        // An undocked camera keeps covering the whole surface.
        let mut placement = self.placement.lock().unwrap();
        if !placement.is_docked {
            *placement = CameraPlacement::full(width, height);
        }
    }

    pub fn placement(&self) -> CameraPlacement {
        *self.placement.lock().unwrap()
    }

    /// Pins the camera tile to a corner, 20 px in from the edges.
    pub fn dock_camera(&self, corner: Corner) {
        let (width, height) = self.dimensions();
        let (x, y) = match corner {
            Corner::TopLeft => (DOCK_MARGIN, DOCK_MARGIN),
            Corner::TopRight => (width - DOCKED_WIDTH - DOCK_MARGIN, DOCK_MARGIN),
            Corner::BottomLeft => (DOCK_MARGIN, height - DOCKED_HEIGHT - DOCK_MARGIN),
            Corner::BottomRight => (
                width - DOCKED_WIDTH - DOCK_MARGIN,
                height - DOCKED_HEIGHT - DOCK_MARGIN,
            ),
        };
        info!(?corner, x, y, "docking camera");
        *self.placement.lock().unwrap() = CameraPlacement {
            x,
            y,
            width: DOCKED_WIDTH,
            height: DOCKED_HEIGHT,
            is_docked: true,
        };
    }

    pub fn undock_camera(&self) {
        let (width, height) = self.dimensions();
        debug!("undocking camera");
        *self.placement.lock().unwrap() = CameraPlacement::full(width, height);
        *self.drag.lock().unwrap() = None;
    }

    /// Starts dragging if the point is inside the docked tile. Returns
    /// whether a drag began; undocked cameras cannot be dragged.
    pub fn begin_drag(&self, x: f64, y: f64) -> bool {
        let placement = self.placement();
        if !placement.is_docked || !placement.contains(x, y) {
            return false;
        }
        *self.drag.lock().unwrap() = Some(DragState {
            offset_x: x - placement.x,
            offset_y: y - placement.y,
        });
        true
    }

    /// Moves the tile under an active drag, clamped inside the surface.
    pub fn drag_to(&self, x: f64, y: f64) {
        let drag = self.drag.lock().unwrap();
        let Some(state) = drag.as_ref() else { return };

        let (width, height) = self.dimensions();
        let mut placement = self.placement.lock().unwrap();
        if !placement.is_docked {
            return;
        }
        let max_x = width - placement.width;
        let max_y = height - placement.height;
        placement.x = (x - state.offset_x).clamp(0.0, max_x);
        placement.y = (y - state.offset_y).clamp(0.0, max_y);
    }

    pub fn end_drag(&self) {
        *self.drag.lock().unwrap() = None;
    }

    /// Placement reaction when the camera comes up: picture-in-picture if a
    /// screen-share is already running, full surface otherwise.
    pub fn on_camera_acquired(&self, screen_active: bool) {
        if screen_active {
            self.dock_camera(Corner::TopRight);
        } else {
            self.undock_camera();
        }
    }

    /// Screen-share ended: the camera gets the whole surface back.
    pub fn on_screen_stopped(&self) {
        self.undock_camera();
    }

    /// Picks the handle the recording pipeline consumes: composed when both
    /// sources are live, the single source unchanged otherwise.
    pub fn select_output(
        &self,
        camera: Option<&Arc<MediaHandle>>,
        screen: Option<&Arc<MediaHandle>>,
    ) -> Option<Arc<MediaHandle>> {
        match (camera, screen) {
            (Some(camera), Some(screen)) => {
                Some(self.surface.compose(camera, screen, self.placement()))
            }
            (Some(camera), None) => Some(camera.clone()),
            (None, Some(screen)) => Some(screen.clone()),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Source;
    use tokio::sync::mpsc;

    /// Passthrough surface: "composes" by returning the screen handle.
    struct TestSurface;

    impl Surface for TestSurface {
        fn compose(
            &self,
            _camera: &Arc<MediaHandle>,
            screen: &Arc<MediaHandle>,
            _placement: CameraPlacement,
        ) -> Arc<MediaHandle> {
            screen.clone()
        }
    }

    fn compositor() -> Compositor {
        Compositor::new(Box::new(TestSurface))
    }

    fn handle(source: Source) -> Arc<MediaHandle> {
        let (_tx, rx) = mpsc::channel(1);
        MediaHandle::new(source, rx)
    }

    #[test]
    fn test_dock_corners() {
        let comp = compositor();

        comp.dock_camera(Corner::TopLeft);
        assert_eq!(comp.placement().x, 20.0);
        assert_eq!(comp.placement().y, 20.0);

        comp.dock_camera(Corner::TopRight);
        assert_eq!(comp.placement().x, 1280.0 - 250.0 - 20.0);
        assert_eq!(comp.placement().y, 20.0);

        comp.dock_camera(Corner::BottomRight);
        assert_eq!(comp.placement().x, 1280.0 - 250.0 - 20.0);
        assert_eq!(comp.placement().y, 720.0 - 150.0 - 20.0);

        assert!(comp.placement().is_docked);
        assert_eq!(comp.placement().width, DOCKED_WIDTH);
    }

    #[test]
    fn test_undock_restores_full_surface() {
        let comp = compositor();
        comp.dock_camera(Corner::TopRight);
        comp.undock_camera();

        let placement = comp.placement();
        assert!(!placement.is_docked);
        assert_eq!((placement.width, placement.height), comp.dimensions());
    }

    #[test]
    fn test_drag_requires_docked_tile_hit() {
        let comp = compositor();

        // Undocked: no drag at all.
        assert!(!comp.begin_drag(100.0, 100.0));

        comp.dock_camera(Corner::TopLeft);
        // Outside the 250x150 tile at (20, 20).
        assert!(!comp.begin_drag(500.0, 500.0));
        // Inside it.
        assert!(comp.begin_drag(30.0, 30.0));
    }

    #[test]
    fn test_drag_clamps_inside_surface() {
        let comp = compositor();
        comp.dock_camera(Corner::TopLeft);
        assert!(comp.begin_drag(20.0, 20.0)); // grab the tile's corner

        comp.drag_to(-500.0, -500.0);
        let placement = comp.placement();
        assert_eq!((placement.x, placement.y), (0.0, 0.0));

        comp.drag_to(5000.0, 5000.0);
        let placement = comp.placement();
        assert_eq!(placement.x, 1280.0 - DOCKED_WIDTH);
        assert_eq!(placement.y, 720.0 - DOCKED_HEIGHT);

        comp.end_drag();
        comp.drag_to(300.0, 300.0); // drag ended, must not move
        assert_eq!(comp.placement().x, 1280.0 - DOCKED_WIDTH);
    }

    #[test]
    fn test_camera_auto_placement() {
        let comp = compositor();

        comp.on_camera_acquired(true);
        assert!(comp.placement().is_docked);

        comp.on_screen_stopped();
        assert!(!comp.placement().is_docked);

        comp.on_camera_acquired(false);
        assert!(!comp.placement().is_docked);
    }

    #[test]
    fn test_output_selection_bypasses_single_source() {
        let comp = compositor();
        let camera = handle(Source::Camera);
        let screen = handle(Source::Screen);

        let out = comp.select_output(Some(&camera), None).unwrap();
        assert_eq!(out.id, camera.id);

        let out = comp.select_output(None, Some(&screen)).unwrap();
        assert_eq!(out.id, screen.id);

        assert!(comp.select_output(None, None).is_none());

        // Both live: the surface composes (test surface returns the screen).
        let out = comp.select_output(Some(&camera), Some(&screen)).unwrap();
        assert_eq!(out.id, screen.id);
    }
}
