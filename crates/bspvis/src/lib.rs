// bspvis — precomputed visibility and area portal connectivity for BSP maps

pub mod bspfile;
pub mod vis;
