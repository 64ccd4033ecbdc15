//! Options-menu navigation.
//!
//! A single parametrized navigation function over a fixed step graph. Menu
//! entries carry a tagged selection (device id, map id, category) and routing
//! is a plain match, so no per-device or per-map handler is ever synthesized
//! at runtime. Single-entry device and map lists skip straight through their
//! submenu.

/// What the menus navigate over: the session's devices and their maps.
#[derive(Debug, Clone, Default)]
pub struct MenuView {
    pub devices: Vec<MenuDevice>,
}

#[derive(Debug, Clone)]
pub struct MenuDevice {
    pub duid: String,
    pub name: String,
    pub maps: Vec<(u32, String)>,
}

impl MenuView {
    fn device(&self, duid: &str) -> Option<&MenuDevice> {
        self.devices.iter().find(|d| d.duid == duid)
    }
}

/// One position in the options menu graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuStep {
    Init,
    DeviceList,
    DeviceMapList { duid: String },
    DeviceMapOptions { duid: String, map_id: u32 },
    /// Terminal form steps; the caller renders the form and persists the
    /// result through the options store.
    DomainForm,
    MapsMenu,
    DrawablesForm,
    SizesForm,
    ImageConfigForm { duid: String, map_id: u32 },
    RoomColorsForm { duid: String, map_id: u32 },
}

/// A selectable entry, tagged with everything routing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuSelection {
    Domain,
    Maps,
    Devices,
    Drawables,
    Sizes,
    Device(String),
    Map(u32),
    ImageConfig,
    RoomColors,
}

/// Result of entering a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuOutcome {
    /// Show a menu with these (selection, label) entries.
    Menu {
        step: MenuStep,
        entries: Vec<(MenuSelection, String)>,
    },
    /// Show a form for this terminal step.
    Form(MenuStep),
    /// Navigation dead end (stale id, empty view).
    Abort(&'static str),
}

/// Enter a step, producing its menu or form, auto-skipping single-entry
/// lists.
pub fn enter(view: &MenuView, step: MenuStep) -> MenuOutcome {
    match step {
        MenuStep::Init => MenuOutcome::Menu {
            step: MenuStep::Init,
            entries: vec![
                (MenuSelection::Domain, "General".to_string()),
                (MenuSelection::Maps, "Map appearance".to_string()),
                (MenuSelection::Devices, "Devices".to_string()),
            ],
        },
        MenuStep::DeviceList => match view.devices.len() {
            0 => MenuOutcome::Abort("no devices"),
            1 => enter(
                view,
                MenuStep::DeviceMapList {
                    duid: view.devices[0].duid.clone(),
                },
            ),
            _ => MenuOutcome::Menu {
                step: MenuStep::DeviceList,
                entries: view
                    .devices
                    .iter()
                    .map(|d| (MenuSelection::Device(d.duid.clone()), d.name.clone()))
                    .collect(),
            },
        },
        MenuStep::DeviceMapList { duid } => {
            let Some(device) = view.device(&duid) else {
                return MenuOutcome::Abort("unknown device");
            };
            match device.maps.len() {
                0 => MenuOutcome::Abort("device has no maps"),
                1 => enter(
                    view,
                    MenuStep::DeviceMapOptions {
                        duid,
                        map_id: device.maps[0].0,
                    },
                ),
                _ => MenuOutcome::Menu {
                    step: MenuStep::DeviceMapList { duid },
                    entries: device
                        .maps
                        .iter()
                        .map(|(id, name)| (MenuSelection::Map(*id), name.clone()))
                        .collect(),
                },
            }
        }
        MenuStep::DeviceMapOptions { duid, map_id } => MenuOutcome::Menu {
            step: MenuStep::DeviceMapOptions { duid, map_id },
            entries: vec![
                (MenuSelection::ImageConfig, "Image layout".to_string()),
                (MenuSelection::RoomColors, "Room colors".to_string()),
            ],
        },
        MenuStep::MapsMenu => MenuOutcome::Menu {
            step: MenuStep::MapsMenu,
            entries: vec![
                (MenuSelection::Drawables, "Layers".to_string()),
                (MenuSelection::Sizes, "Object sizes".to_string()),
            ],
        },
        form @ (MenuStep::DomainForm
        | MenuStep::DrawablesForm
        | MenuStep::SizesForm
        | MenuStep::ImageConfigForm { .. }
        | MenuStep::RoomColorsForm { .. }) => MenuOutcome::Form(form),
    }
}

/// Route one selection made on a step to the next step and enter it.
pub fn navigate(view: &MenuView, step: &MenuStep, selection: MenuSelection) -> MenuOutcome {
    let next = match (step, selection) {
        (MenuStep::Init, MenuSelection::Domain) => MenuStep::DomainForm,
        (MenuStep::Init, MenuSelection::Maps) => MenuStep::MapsMenu,
        (MenuStep::Init, MenuSelection::Devices) => MenuStep::DeviceList,
        (MenuStep::MapsMenu, MenuSelection::Drawables) => MenuStep::DrawablesForm,
        (MenuStep::MapsMenu, MenuSelection::Sizes) => MenuStep::SizesForm,
        (MenuStep::DeviceList, MenuSelection::Device(duid)) => MenuStep::DeviceMapList { duid },
        (MenuStep::DeviceMapList { duid }, MenuSelection::Map(map_id)) => {
            MenuStep::DeviceMapOptions {
                duid: duid.clone(),
                map_id,
            }
        }
        (MenuStep::DeviceMapOptions { duid, map_id }, MenuSelection::ImageConfig) => {
            MenuStep::ImageConfigForm {
                duid: duid.clone(),
                map_id: *map_id,
            }
        }
        (MenuStep::DeviceMapOptions { duid, map_id }, MenuSelection::RoomColors) => {
            MenuStep::RoomColorsForm {
                duid: duid.clone(),
                map_id: *map_id,
            }
        }
        _ => return MenuOutcome::Abort("selection does not apply to this step"),
    };
    enter(view, next)
}
