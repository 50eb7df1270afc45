//! The seam between a pane and whatever renders it.

use std::sync::Arc;

use openspace_ipc::PaneId;
use serde::{Deserialize, Serialize};

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

pub type InputHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type GeometryHandler = Arc<dyn Fn(Dimensions) + Send + Sync>;

/// A rendered terminal view.
///
/// Implementations must not call back into the controller from `write` or
/// `dispose`; handlers are the only way in.
pub trait Surface: Send + Sync {
    /// Render shell output.
    fn write(&self, text: &str);

    /// Current geometry.
    fn dimensions(&self) -> Dimensions;

    /// Install the handler for keystrokes. Replaces any previous handler.
    fn on_input(&self, handler: InputHandler);

    /// Install the handler for geometry changes. Replaces any previous handler.
    fn on_geometry_change(&self, handler: GeometryHandler);

    /// Release the view. Handlers must not fire afterwards.
    fn dispose(&self);
}

pub trait SurfaceFactory: Send + Sync {
    fn create(&self, pane: &PaneId) -> Arc<dyn Surface>;
}
