//! One-time negotiation of optional server features.

use bitflags::bitflags;
use x11rb::{
    connection::{Connection, RequestConnection},
    errors::ReplyError,
    protocol::{
        shape::{self, ConnectionExt as _},
        xkb::{self, ConnectionExt as _},
        xproto::{Colormap, ColormapAlloc, ConnectionExt as _, Depth, Screen, VisualClass, Visualid},
    },
};

use crate::Result;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capability: u8 {
        const XKB = 1 << 0;
        /// SHAPE 1.1 or newer, i.e. input shapes.
        const SHAPE = 1 << 1;
        /// A 32-bit TrueColor visual with its own colormap.
        const ARGB_VISUAL = 1 << 2;
    }
}

/// Depth, visual and colormap used for every window the manager creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisualConfig {
    pub depth: u8,
    pub visual_id: Visualid,
    pub colormap: Colormap,
}

impl VisualConfig {
    fn root_default(screen: &Screen) -> Self {
        Self {
            depth: screen.root_depth,
            visual_id: screen.root_visual,
            colormap: screen.default_colormap,
        }
    }
}

/// Result of [`negotiate`]. Never changes afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub flags: Capability,
    pub visual: VisualConfig,
}

/// Query XKB, SHAPE and the ARGB visual. Missing features only clear flags;
/// the only error returned is a broken connection.
pub fn negotiate<C: Connection>(conn: &C, screen: &Screen) -> Result<Capabilities> {
    // Both QueryExtension requests go out before either reply is awaited.
    conn.prefetch_extension_information(xkb::X11_EXTENSION_NAME)?;
    conn.prefetch_extension_information(shape::X11_EXTENSION_NAME)?;

    let mut flags = Capability::empty();

    if negotiate_xkb(conn)? {
        flags |= Capability::XKB;
    } else {
        tracing::debug!("xkb is not present on this server");
    }

    if negotiate_shape(conn)? {
        flags |= Capability::SHAPE;
    } else {
        tracing::debug!("shape 1.1 is not present on this server");
    }

    let visual = match negotiate_argb_visual(conn, screen)? {
        Some(visual) => {
            flags |= Capability::ARGB_VISUAL;
            visual
        }
        None => VisualConfig::root_default(screen),
    };

    tracing::info!(
        ?flags,
        depth = visual.depth,
        visual_id = format_args!("{:#010x}", visual.visual_id),
        "server capabilities negotiated"
    );

    Ok(Capabilities { flags, visual })
}

fn negotiate_xkb<C: Connection>(conn: &C) -> Result<bool> {
    if conn.extension_information(xkb::X11_EXTENSION_NAME)?.is_none() {
        return Ok(false);
    }

    let Some(reply) = recoverable(conn.xkb_use_extension(1, 0)?.reply())? else {
        return Ok(false);
    };
    if !reply.supported {
        tracing::warn!(
            server_major = reply.server_major,
            server_minor = reply.server_minor,
            "server refused xkb 1.0"
        );
        return Ok(false);
    }

    let events = xkb::EventType::STATE_NOTIFY
        | xkb::EventType::MAP_NOTIFY
        | xkb::EventType::NEW_KEYBOARD_NOTIFY;
    let selected = conn
        .xkb_select_events(
            u16::from(xkb::ID::USE_CORE_KBD),
            xkb::EventType::from(0u16),
            events,
            xkb::MapPart::from(0xffu16),
            xkb::MapPart::from(0xffu16),
            &xkb::SelectEventsAux::new(),
        )?
        .check();
    Ok(recoverable(selected)?.is_some())
}

fn negotiate_shape<C: Connection>(conn: &C) -> Result<bool> {
    if conn.extension_information(shape::X11_EXTENSION_NAME)?.is_none() {
        return Ok(false);
    }
    let Some(version) = recoverable(conn.shape_query_version()?.reply())? else {
        return Ok(false);
    };
    Ok(shape_supports_input(version.major_version, version.minor_version))
}

fn negotiate_argb_visual<C: Connection>(conn: &C, screen: &Screen) -> Result<Option<VisualConfig>> {
    let Some((depth, visual_id)) = find_argb_visual(&screen.allowed_depths) else {
        return Ok(None);
    };

    let colormap = conn.generate_id()?;
    let created = conn
        .create_colormap(ColormapAlloc::NONE, colormap, screen.root, visual_id)?
        .check();
    if recoverable(created)?.is_none() {
        tracing::warn!(
            visual_id = format_args!("{visual_id:#010x}"),
            "could not create colormap for 32-bit visual, using root visual"
        );
        return Ok(None);
    }

    Ok(Some(VisualConfig {
        depth,
        visual_id,
        colormap,
    }))
}

/// First 32-bit TrueColor visual the screen advertises.
pub fn find_argb_visual(depths: &[Depth]) -> Option<(u8, Visualid)> {
    depths
        .iter()
        .filter(|depth| depth.depth == 32)
        .find_map(|depth| {
            depth
                .visuals
                .iter()
                .find(|visual| visual.class == VisualClass::TRUE_COLOR)
                .map(|visual| (depth.depth, visual.visual_id))
        })
}

/// Input shapes arrived with SHAPE 1.1.
pub fn shape_supports_input(major: u16, minor: u16) -> bool {
    (major, minor) >= (1, 1)
}

/// Protocol errors turn into `None`; a broken connection stays an error.
fn recoverable<T>(result: std::result::Result<T, ReplyError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ReplyError::X11Error(err)) => {
            tracing::debug!(error_kind = ?err.error_kind, "optional request failed");
            Ok(None)
        }
        Err(ReplyError::ConnectionError(err)) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11rb::protocol::xproto::Visualtype;

    fn visual(visual_id: Visualid, class: VisualClass) -> Visualtype {
        Visualtype {
            visual_id,
            class,
            bits_per_rgb_value: 8,
            colormap_entries: 256,
            red_mask: 0xff0000,
            green_mask: 0x00ff00,
            blue_mask: 0x0000ff,
        }
    }

    #[test]
    fn picks_true_color_visual_at_depth_32() {
        let depths = vec![
            Depth {
                depth: 24,
                visuals: vec![visual(0x21, VisualClass::TRUE_COLOR)],
            },
            Depth {
                depth: 32,
                visuals: vec![
                    visual(0x40, VisualClass::DIRECT_COLOR),
                    visual(0x41, VisualClass::TRUE_COLOR),
                ],
            },
        ];
        assert_eq!(find_argb_visual(&depths), Some((32, 0x41)));
    }

    #[test]
    fn no_argb_visual_on_a_24_bit_only_server() {
        let depths = vec![Depth {
            depth: 24,
            visuals: vec![visual(0x21, VisualClass::TRUE_COLOR)],
        }];
        assert_eq!(find_argb_visual(&depths), None);
    }

    #[test]
    fn shape_input_needs_one_point_one() {
        assert!(!shape_supports_input(1, 0));
        assert!(shape_supports_input(1, 1));
        assert!(shape_supports_input(2, 0));
    }
}
