use crate::scene::ItemId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub(crate) u32);

impl WindowId {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// A mapped toplevel and the item tree that draws it.
#[derive(Debug, Clone)]
pub struct Window {
    id: WindowId,
    pid: Option<u32>,
    title: String,
    exclude_from_capture: bool,
    root: ItemId,
}

impl Window {
    pub(crate) fn new(id: WindowId, pid: Option<u32>, title: String, root: ItemId) -> Self {
        Self {
            id,
            pid,
            title,
            exclude_from_capture: false,
            root,
        }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    /// Process id of the client, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether the client asked to be left out of screencasts and screenshots.
    pub fn exclude_from_capture(&self) -> bool {
        self.exclude_from_capture
    }

    pub(crate) fn set_exclude_from_capture(&mut self, value: bool) {
        self.exclude_from_capture = value;
    }

    /// The item all of this window's content hangs off.
    pub fn root(&self) -> ItemId {
        self.root
    }
}
