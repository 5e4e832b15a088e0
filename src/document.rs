//! Document state: the editable content of one canvas.
//!
//! DESIGN
//! ======
//! `DocumentState` mirrors the JSON stored in `canvases.canvas_data`, so the
//! same value hydrates a session, is mutated by participant edits, and is
//! written back verbatim by autosave. It is plain data with no locking of its
//! own; the owning session guards it.
//!
//! Edits address pieces by zero-based index. An index that does not refer to
//! an existing piece is a stale edit from a client that has not yet seen a
//! concurrent structural change. Such edits leave the document untouched and
//! report `Applied::OutOfRange` so the caller can count them.

use serde::{Deserialize, Serialize};

/// Stable identity of a canvas (primary key of the `canvases` table).
pub type CanvasId = i64;

// =============================================================================
// TYPES
// =============================================================================

/// Full editable state of one canvas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub background_color: String,
    /// Brush settings new pieces are drawn with.
    #[serde(default)]
    pub piece_settings: PieceSettings,
    #[serde(default)]
    pub ruler_settings: RulerSettings,
    #[serde(default)]
    pub pieces_manager: PiecesManager,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSettings {
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulerSettings {
    #[serde(default)]
    pub show_units: bool,
    #[serde(default)]
    pub show_lines: bool,
}

/// Ordered piece list plus the cached extents enclosing all pieces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PiecesManager {
    #[serde(default)]
    pub pieces: Vec<Piece>,
    #[serde(flatten)]
    pub extents: Extents,
}

/// One drawn stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    pub settings: PieceSettings,
    /// SVG path data for the stroke.
    pub path: String,
    #[serde(rename = "move", default)]
    pub transform: Transform,
    #[serde(flatten)]
    pub extents: Extents,
}

/// Axis-aligned bounds. Each side is optional because clients may omit
/// bounds for pieces they have not measured yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extents {
    #[serde(default)]
    pub left_most: Option<f64>,
    #[serde(default)]
    pub right_most: Option<f64>,
    #[serde(default)]
    pub top_most: Option<f64>,
    #[serde(default)]
    pub bottom_most: Option<f64>,
}

/// 2D/3D affine transform in DOMMatrix layout. Missing fields fall back to
/// the identity matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
    pub m11: f64,
    pub m12: f64,
    pub m13: f64,
    pub m14: f64,
    pub m21: f64,
    pub m22: f64,
    pub m23: f64,
    pub m24: f64,
    pub m31: f64,
    pub m32: f64,
    pub m33: f64,
    pub m34: f64,
    pub m41: f64,
    pub m42: f64,
    pub m43: f64,
    pub m44: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
            m11: 1.0,
            m12: 0.0,
            m13: 0.0,
            m14: 0.0,
            m21: 0.0,
            m22: 1.0,
            m23: 0.0,
            m24: 0.0,
            m31: 0.0,
            m32: 0.0,
            m33: 1.0,
            m34: 0.0,
            m41: 0.0,
            m42: 0.0,
            m43: 0.0,
            m44: 1.0,
        }
    }
}

/// Canvas-level fields carried by `update-canvas-data`. Absent fields are
/// left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasDataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
}

/// Result of an index-addressed edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    OutOfRange { index: i64, len: usize },
}

// =============================================================================
// EXTENTS
// =============================================================================

impl Extents {
    /// Smallest extents enclosing every input. A side stays `None` only if no
    /// input defines it.
    pub fn enclosing<'a>(items: impl IntoIterator<Item = &'a Extents>) -> Self {
        items.into_iter().fold(Self::default(), |acc, e| Self {
            left_most: merge(acc.left_most, e.left_most, f64::min),
            right_most: merge(acc.right_most, e.right_most, f64::max),
            top_most: merge(acc.top_most, e.top_most, f64::min),
            bottom_most: merge(acc.bottom_most, e.bottom_most, f64::max),
        })
    }
}

fn merge(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(pick(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

// =============================================================================
// MUTATIONS
// =============================================================================

impl DocumentState {
    #[must_use]
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces_manager.pieces
    }

    /// Append a piece to the end of the sequence.
    pub fn add_piece(&mut self, piece: Piece) {
        self.pieces_manager.pieces.push(piece);
        self.refresh_extents();
    }

    /// Replace the piece at `index` in place.
    pub fn update_piece(&mut self, index: i64, piece: Piece) -> Applied {
        let Some(slot) = self.slot(index) else {
            return self.out_of_range(index);
        };
        self.pieces_manager.pieces[slot] = piece;
        self.refresh_extents();
        Applied::Changed
    }

    /// Remove the piece at `index`, shifting later pieces down.
    pub fn remove_piece(&mut self, index: i64) -> Applied {
        let Some(slot) = self.slot(index) else {
            return self.out_of_range(index);
        };
        self.pieces_manager.pieces.remove(slot);
        self.refresh_extents();
        Applied::Changed
    }

    /// Apply canvas-level fields. The name is only taken when `may_rename`
    /// is set; the background color is always taken when present.
    pub fn update_canvas_data(&mut self, patch: &CanvasDataPatch, may_rename: bool) {
        if let Some(color) = &patch.background_color {
            self.background_color.clone_from(color);
        }
        if may_rename {
            if let Some(name) = &patch.name {
                self.name.clone_from(name);
            }
        }
    }

    /// Current canvas-level fields, used as the rebroadcast payload after
    /// `update-canvas-data` so every peer converges on the merged result.
    #[must_use]
    pub fn canvas_data(&self) -> CanvasDataPatch {
        CanvasDataPatch { name: Some(self.name.clone()), background_color: Some(self.background_color.clone()) }
    }

    fn slot(&self, index: i64) -> Option<usize> {
        usize::try_from(index)
            .ok()
            .filter(|i| *i < self.pieces_manager.pieces.len())
    }

    fn out_of_range(&self, index: i64) -> Applied {
        Applied::OutOfRange { index, len: self.pieces_manager.pieces.len() }
    }

    fn refresh_extents(&mut self) {
        self.pieces_manager.extents = Extents::enclosing(self.pieces_manager.pieces.iter().map(|p| &p.extents));
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
