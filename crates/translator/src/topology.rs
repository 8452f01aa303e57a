//! Guest primitive type to host topology translation.
use xenos::primitive::{PrimitiveType, TessellationMode};

use crate::host::Topology;

/// Host topology of a (processed) guest primitive. `None` if the host can't draw it directly,
/// which means primitive processing should have converted it.
pub fn host_topology(
    primitive: PrimitiveType,
    tessellation: Option<TessellationMode>,
) -> Option<Topology> {
    if let Some(mode) = tessellation {
        let adaptive = mode == TessellationMode::Adaptive;
        return Some(match primitive {
            // adaptive tessellation reads the factors from the index buffer, one per edge
            PrimitiveType::TriangleList | PrimitiveType::TrianglePatch if adaptive => {
                Topology::PatchList(1)
            }
            PrimitiveType::TriangleList | PrimitiveType::TrianglePatch => Topology::PatchList(3),
            PrimitiveType::QuadList | PrimitiveType::QuadPatch if adaptive => {
                Topology::PatchList(1)
            }
            PrimitiveType::QuadList | PrimitiveType::QuadPatch => Topology::PatchList(4),
            _ => return None,
        });
    }

    Some(match primitive {
        PrimitiveType::PointList => Topology::PointList,
        PrimitiveType::LineList => Topology::LineList,
        PrimitiveType::LineStrip => Topology::LineStrip,
        PrimitiveType::TriangleList => Topology::TriangleList,
        PrimitiveType::TriangleStrip => Topology::TriangleStrip,
        // expanded to two triangles by the vertex shader
        PrimitiveType::RectangleList => Topology::TriangleList,
        // four vertices per quad, expanded by the geometry stage
        PrimitiveType::QuadList => Topology::LineListAdjacency,
        _ => return None,
    })
}
