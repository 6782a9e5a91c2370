// vis.rs — cluster visibility decoding and area portal connectivity

use crate::bspfile::{
    AreaPortal, VisKind, MAX_MAP_AREAPORTALS, MAX_MAP_AREAS, MAX_MAP_LEAFS, MAX_MAP_VISIBILITY,
};
use log::{debug, warn};

// ============================================================
// Runtime structures (not in the BSP file, built by the loader)
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Node {
    /// Children of this node; a negative value addresses leaf `-1 - child`.
    pub children: [i32; 2],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Leaf {
    /// Visibility cluster this leaf belongs to, -1 for solid space.
    pub cluster: i32,
    pub area: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Area {
    pub num_area_portals: usize,
    pub first_area_portal: usize,
    pub flood_num: i32,
    pub flood_valid: i32,
}

/// Tables produced by the BSP loader, handed over once per map. Offsets in
/// `vis_offsets` index into `visibility`; an empty `visibility` means the map
/// was compiled without vis data.
#[derive(Debug, Clone, Default)]
pub struct ModelTables {
    pub nodes: Vec<Node>,
    pub leafs: Vec<Leaf>,
    pub areas: Vec<Area>,
    pub area_portals: Vec<AreaPortal>,
    pub num_clusters: usize,
    pub visibility: Vec<u8>,
    /// Per cluster: [PVS offset, PHS offset], indexed by `VisKind`.
    pub vis_offsets: Vec<[usize; 2]>,
}

// ============================================================
// Vis decompression
// ============================================================

/// Expand one cluster's run-length encoded bit vector into `out`, producing
/// exactly `row` bytes. A nonzero byte is a literal; a zero byte is followed
/// by a count of zero bytes to emit.
fn decompress_vis(vis: &[u8], row: usize, in_ofs: usize, out: &mut [u8]) {
    if vis.is_empty() {
        // no vis info, so make all visible
        out[..row].fill(0xff);
        return;
    }

    let mut in_p = in_ofs;
    let mut out_p = 0;

    while out_p < row {
        if in_p >= vis.len() {
            warn!("vis decompression ran off the end of the compressed data");
            out[out_p..row].fill(0);
            return;
        }

        if vis[in_p] != 0 {
            out[out_p] = vis[in_p];
            out_p += 1;
            in_p += 1;
            continue;
        }

        // zero byte, the next byte is the run length
        if in_p + 1 >= vis.len() {
            warn!("vis decompression ran off the end of the compressed data");
            out[out_p..row].fill(0);
            return;
        }
        let mut c = vis[in_p + 1] as usize;
        in_p += 2;
        if out_p + c > row {
            warn!(
                "vis decompression overrun, run of {} clamped to {}",
                c,
                row - out_p
            );
            c = row - out_p;
        }
        out[out_p..out_p + c].fill(0);
        out_p += c;
    }
}

// ============================================================
// Context: holds the loaded vis state
// ============================================================

pub struct VisContext {
    pub nodes: Vec<Node>,
    pub leafs: Vec<Leaf>,
    pub areas: Vec<Area>,
    pub area_portals: Vec<AreaPortal>,

    pub num_clusters: usize,
    pub visibility: Vec<u8>,
    pub vis_offsets: Vec<[usize; 2]>,

    pub portal_open: Vec<bool>,
    pub flood_valid: i32,

    /// Debug override: report every area as connected to every other.
    pub no_areas: bool,

    // Scratch rows reused by every decode
    pvs_row: Vec<u8>,
    phs_row: Vec<u8>,
}

impl VisContext {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            leafs: vec![Leaf::default()], // queries are safe before a map loads
            areas: vec![Area::default()],
            area_portals: Vec::new(),

            num_clusters: 1,
            visibility: Vec::new(),
            vis_offsets: Vec::new(),

            portal_open: vec![false; MAX_MAP_AREAPORTALS],
            flood_valid: 0,

            no_areas: false,

            pvs_row: vec![0u8; MAX_MAP_LEAFS / 8],
            phs_row: vec![0u8; MAX_MAP_LEAFS / 8],
        }
    }

    // ============================================================
    // Model installation
    // ============================================================

    /// Install the tables for a freshly loaded map. All portals start closed
    /// and area connectivity is flooded once. Structurally inconsistent
    /// tables indicate a corrupt map and abort.
    pub fn load(&mut self, tables: ModelTables) {
        if tables.areas.len() > MAX_MAP_AREAS {
            panic!("map has too many areas ({})", tables.areas.len());
        }
        if tables.area_portals.len() > MAX_MAP_AREAPORTALS {
            panic!("map has too many area portals ({})", tables.area_portals.len());
        }
        if tables.leafs.len() > MAX_MAP_LEAFS {
            panic!("map has too many leafs ({})", tables.leafs.len());
        }
        if tables.num_clusters > MAX_MAP_LEAFS {
            panic!("map has too many clusters ({})", tables.num_clusters);
        }
        if tables.visibility.len() > MAX_MAP_VISIBILITY {
            panic!("map has too much vis data ({} bytes)", tables.visibility.len());
        }
        if !tables.visibility.is_empty() && tables.vis_offsets.len() != tables.num_clusters {
            panic!(
                "cluster offset table has {} entries for {} clusters",
                tables.vis_offsets.len(),
                tables.num_clusters
            );
        }
        for (i, area) in tables.areas.iter().enumerate() {
            if area.first_area_portal + area.num_area_portals > tables.area_portals.len() {
                panic!("area {} portal slice exceeds the portal table", i);
            }
        }
        for (i, portal) in tables.area_portals.iter().enumerate() {
            if portal.portal_num < 0 || portal.portal_num as usize >= MAX_MAP_AREAPORTALS {
                panic!("area portal {} has bad portal number {}", i, portal.portal_num);
            }
            if portal.other_area < 0 || portal.other_area as usize >= tables.areas.len() {
                panic!("area portal {} references bad area {}", i, portal.other_area);
            }
        }

        self.nodes = tables.nodes;
        self.leafs = if tables.leafs.is_empty() {
            vec![Leaf::default()]
        } else {
            tables.leafs
        };
        self.areas = if tables.areas.is_empty() {
            vec![Area::default()]
        } else {
            tables.areas
        };
        self.area_portals = tables.area_portals;
        self.num_clusters = tables.num_clusters.max(1);
        self.visibility = tables.visibility;
        self.vis_offsets = tables.vis_offsets;

        if self.visibility.is_empty() {
            debug!("map has no vis data, culling will assume full visibility");
        }

        for area in &mut self.areas {
            area.flood_num = 0;
            area.flood_valid = 0;
        }
        self.portal_open.fill(false);
        self.flood_area_connections();
    }

    // ============================================================
    // Read accessors
    // ============================================================

    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    pub fn num_areas(&self) -> usize {
        self.areas.len()
    }

    /// Bytes per decompressed vis row for the loaded cluster count.
    pub fn row_bytes(&self) -> usize {
        (self.num_clusters + 7) >> 3
    }

    pub fn leaf_cluster(&self, leaf_num: usize) -> i32 {
        if leaf_num >= self.leafs.len() {
            panic!("leaf {} out of range ({} leafs)", leaf_num, self.leafs.len());
        }
        self.leafs[leaf_num].cluster
    }

    pub fn leaf_area(&self, leaf_num: usize) -> i32 {
        if leaf_num >= self.leafs.len() {
            panic!("leaf {} out of range ({} leafs)", leaf_num, self.leafs.len());
        }
        self.leafs[leaf_num].area
    }

    // ============================================================
    // PVS / PHS
    // ============================================================

    /// Decode the potentially visible set for a cluster. The returned slice
    /// aliases a per-context scratch row and is valid until the next decode
    /// on this context. Cluster -1 (no cluster) sees nothing.
    pub fn cluster_pvs(&mut self, cluster: i32) -> &[u8] {
        let row = self.row_bytes();
        if cluster == -1 {
            self.pvs_row[..row].fill(0);
        } else {
            let in_ofs = if self.visibility.is_empty() {
                0
            } else {
                self.vis_offsets[cluster as usize][VisKind::Pvs as usize]
            };
            decompress_vis(&self.visibility, row, in_ofs, &mut self.pvs_row);
        }
        &self.pvs_row[..row]
    }

    /// Decode the potentially hearable set for a cluster. Same scratch-row
    /// contract as `cluster_pvs`, with its own row.
    pub fn cluster_phs(&mut self, cluster: i32) -> &[u8] {
        let row = self.row_bytes();
        if cluster == -1 {
            self.phs_row[..row].fill(0);
        } else {
            let in_ofs = if self.visibility.is_empty() {
                0
            } else {
                self.vis_offsets[cluster as usize][VisKind::Phs as usize]
            };
            decompress_vis(&self.visibility, row, in_ofs, &mut self.phs_row);
        }
        &self.phs_row[..row]
    }

    // ============================================================
    // Area portals / flooding
    // ============================================================

    fn flood_area_r(&mut self, area_idx: usize, flood_num: i32) {
        if self.areas[area_idx].flood_valid == self.flood_valid {
            if self.areas[area_idx].flood_num == flood_num {
                return;
            }
            panic!("flood_area_r: reflooded area {}", area_idx);
        }

        self.areas[area_idx].flood_num = flood_num;
        self.areas[area_idx].flood_valid = self.flood_valid;

        let first = self.areas[area_idx].first_area_portal;
        let count = self.areas[area_idx].num_area_portals;

        for i in 0..count {
            let portal = self.area_portals[first + i];
            if self.portal_open[portal.portal_num as usize] {
                self.flood_area_r(portal.other_area as usize, flood_num);
            }
        }
    }

    /// Rebuild flood ids for every area by walking open portals. Bumping the
    /// generation counter invalidates all previous flood assignments, so no
    /// per-area reset is needed.
    pub fn flood_area_connections(&mut self) {
        self.flood_valid += 1;
        let mut flood_num = 0;

        // area 0 is not used
        for i in 1..self.areas.len() {
            if self.areas[i].flood_valid == self.flood_valid {
                continue; // already flooded into
            }
            flood_num += 1;
            self.flood_area_r(i, flood_num);
        }
    }

    /// Open or close an area portal and re-flood all area connections so
    /// `areas_connected` and `write_area_bits` see the new topology.
    pub fn set_area_portal_state(&mut self, portal_num: usize, open: bool) {
        if portal_num > self.area_portals.len() {
            panic!(
                "portal {} out of range ({} area portals)",
                portal_num,
                self.area_portals.len()
            );
        }
        self.portal_open[portal_num] = open;
        self.flood_area_connections();
    }

    /// Whether two areas are connected through open portals.
    pub fn areas_connected(&self, area1: usize, area2: usize) -> bool {
        if self.no_areas {
            return true;
        }
        if area1 >= self.areas.len() || area2 >= self.areas.len() {
            panic!(
                "area {} out of range ({} areas)",
                area1.max(area2),
                self.areas.len()
            );
        }
        self.areas[area1].flood_num == self.areas[area2].flood_num
    }

    /// Write a bit vector of all the areas in the same flood as `area` into
    /// `buffer`. Area 0 (the no-area sentinel) sees everything. Returns the
    /// number of bytes written so callers can size network payloads exactly.
    pub fn write_area_bits(&self, buffer: &mut [u8], area: usize) -> usize {
        let bytes = (self.areas.len() + 7) >> 3;
        if buffer.len() < bytes {
            panic!(
                "area bits buffer too small ({} < {} bytes)",
                buffer.len(),
                bytes
            );
        }

        if self.no_areas {
            // for debugging, send everything
            buffer[..bytes].fill(0xff);
        } else {
            if area >= self.areas.len() {
                panic!("area {} out of range ({} areas)", area, self.areas.len());
            }
            let flood_num = self.areas[area].flood_num;
            buffer[..bytes].fill(0);

            for i in 0..self.areas.len() {
                if self.areas[i].flood_num == flood_num || area == 0 {
                    buffer[i >> 3] |= 1 << (i & 7);
                }
            }
        }

        bytes
    }

    // ============================================================
    // Portal state persistence
    // ============================================================

    /// Write the portal open/closed table for a savegame, one byte per portal.
    pub fn write_portal_state(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        let bytes: Vec<u8> = self
            .portal_open
            .iter()
            .map(|&open| if open { 1 } else { 0 })
            .collect();
        writer.write_all(&bytes)
    }

    /// Restore the portal table written by `write_portal_state` and re-flood
    /// so connectivity is immediately consistent with the restored state.
    pub fn read_portal_state(&mut self, reader: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut bytes = vec![0u8; self.portal_open.len()];
        reader.read_exact(&mut bytes)?;
        for (open, &b) in self.portal_open.iter_mut().zip(bytes.iter()) {
            *open = b != 0;
        }
        self.flood_area_connections();
        Ok(())
    }

    // ============================================================
    // Headnode visibility
    // ============================================================

    /// Whether any leaf under `node_num` has a cluster whose bit is set in
    /// `vis`. A negative node number addresses leaf `-1 - node_num`; a leaf
    /// in no cluster (solid space) is never visible.
    pub fn headnode_visible(&self, node_num: i32, vis: &[u8]) -> bool {
        if node_num < 0 {
            let leaf_num = (-1 - node_num) as usize;
            if leaf_num >= self.leafs.len() {
                panic!("leaf {} out of range ({} leafs)", leaf_num, self.leafs.len());
            }
            let cluster = self.leafs[leaf_num].cluster;
            if cluster == -1 {
                return false;
            }
            let bit = 1u8 << (cluster & 7);
            return vis[(cluster >> 3) as usize] & bit != 0;
        }

        let node_num = node_num as usize;
        if node_num >= self.nodes.len() {
            panic!("node {} out of range ({} nodes)", node_num, self.nodes.len());
        }
        let node = &self.nodes[node_num];

        if self.headnode_visible(node.children[0], vis) {
            return true;
        }
        self.headnode_visible(node.children[1], vis)
    }
}

impl Default for VisContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Global context
// ============================================================

use parking_lot::Mutex;

static VIS_CTX: Mutex<Option<VisContext>> = Mutex::new(None);

/// Install a fresh, empty context as the global vis state.
pub fn init() {
    *VIS_CTX.lock() = Some(VisContext::new());
}

/// Access the global context with a closure. Returns None if not initialized.
pub fn with_context<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut VisContext) -> R,
{
    VIS_CTX.lock().as_mut().map(f)
}

pub fn load(tables: ModelTables) {
    with_context(|c| c.load(tables));
}

/// Returns the PVS for the given cluster, or empty if no context is loaded.
pub fn cluster_pvs(cluster: i32) -> Vec<u8> {
    with_context(|c| c.cluster_pvs(cluster).to_vec()).unwrap_or_default()
}

/// Returns the PHS for the given cluster, or empty if no context is loaded.
pub fn cluster_phs(cluster: i32) -> Vec<u8> {
    with_context(|c| c.cluster_phs(cluster).to_vec()).unwrap_or_default()
}

pub fn set_area_portal_state(portal_num: usize, open: bool) {
    with_context(|c| c.set_area_portal_state(portal_num, open));
}

pub fn areas_connected(area1: usize, area2: usize) -> bool {
    with_context(|c| c.areas_connected(area1, area2)).unwrap_or(true)
}

pub fn write_area_bits(buffer: &mut [u8], area: usize) -> usize {
    with_context(|c| c.write_area_bits(buffer, area)).unwrap_or(0)
}

pub fn headnode_visible(node_num: i32, vis: &[u8]) -> bool {
    with_context(|c| c.headnode_visible(node_num, vis)).unwrap_or(true)
}

/// Debug override for occlusion diagnosis: treat every area as connected.
pub fn set_no_areas(no_areas: bool) {
    with_context(|c| c.no_areas = no_areas);
}

pub fn num_clusters() -> usize {
    with_context(|c| c.num_clusters()).unwrap_or(1)
}

pub fn num_areas() -> usize {
    with_context(|c| c.num_areas()).unwrap_or(1)
}

pub fn leaf_cluster(leaf_num: usize) -> i32 {
    with_context(|c| c.leaf_cluster(leaf_num)).unwrap_or(-1)
}

pub fn leaf_area(leaf_num: usize) -> i32 {
    with_context(|c| c.leaf_area(leaf_num)).unwrap_or(0)
}

// ============================================================
// Tests
// ============================================================
