use bvh::{
    aabb::{Aabb as BvhAabb, Bounded},
    bounding_hierarchy::BHShape,
    bvh::Bvh as BVH,
};
use rt_shared::{Aabb, BvhNode, TriangleRecord};

// Type aliases for specific f32 3D types
type Point3f = nalgebra::Point3<f32>;
type BvhAabbf = BvhAabb<f32, 3>;
type BVHf = BVH<f32, 3>;

/// Wrapper for TriangleRecord to implement BHShape trait for BVH construction
#[derive(Clone, Copy, Debug)]
pub struct BvhTriangle {
    pub triangle: TriangleRecord,
    pub node_index: usize,
}

impl BvhTriangle {
    pub fn new(triangle: TriangleRecord, node_index: usize) -> Self {
        Self { triangle, node_index }
    }

    /// Get the center of the triangle
    pub fn centroid(&self) -> Point3f {
        let c = self.triangle.centroid();
        Point3f::new(c.x, c.y, c.z)
    }
}

impl Bounded<f32, 3> for BvhTriangle {
    fn aabb(&self) -> BvhAabbf {
        let bounds = self.triangle.bounds();
        BvhAabbf::with_bounds(Point3f::from(bounds.min), Point3f::from(bounds.max))
    }
}

impl BHShape<f32, 3> for BvhTriangle {
    fn set_bh_node_index(&mut self, index: usize) {
        self.node_index = index;
    }

    fn bh_node_index(&self) -> usize {
        self.node_index
    }
}

/// Host-side SAH BVH over the gathered triangle records of an acceleration structure
pub struct BvhBuilder;

impl BvhBuilder {
    /// Build a BVH with one triangle per leaf. The root is node 0 and every
    /// triangle appears exactly once in `triangle_indices`.
    pub fn build(triangles: &[TriangleRecord]) -> BvhResult {
        if triangles.is_empty() {
            return BvhResult {
                nodes: vec![BvhNode::leaf(Aabb::empty(), 0, 0)],
                triangle_indices: Vec::new(),
            };
        }

        let mut bvh_triangles: Vec<BvhTriangle> = triangles
            .iter()
            .enumerate()
            .map(|(i, triangle)| BvhTriangle::new(*triangle, i))
            .collect();

        let bvh = BVHf::build(&mut bvh_triangles);

        Self::convert_bvh_nodes(&bvh, &bvh_triangles)
    }

    /// Worst-case node count for `triangle_count` triangles
    pub fn max_nodes(triangle_count: usize) -> usize {
        (2 * triangle_count).max(1)
    }

    /// Convert bvh crate nodes to our depth-first BvhNode layout
    fn convert_bvh_nodes(bvh: &BVHf, bvh_triangles: &[BvhTriangle]) -> BvhResult {
        let mut nodes = Vec::with_capacity(bvh.nodes.len());
        let mut triangle_indices = Vec::with_capacity(bvh_triangles.len());

        Self::convert_node_recursive(&bvh.nodes, 0, bvh_triangles, &mut nodes, &mut triangle_indices);

        BvhResult { nodes, triangle_indices }
    }

    /// Returns the index of the converted node; bounds are rebuilt bottom-up
    /// from the triangles so every parent tightly contains its children.
    fn convert_node_recursive(
        bvh_nodes: &[bvh::bvh::BvhNode<f32, 3>],
        node_index: usize,
        bvh_triangles: &[BvhTriangle],
        result_nodes: &mut Vec<BvhNode>,
        triangle_indices: &mut Vec<u32>,
    ) -> u32 {
        let current_result_index = result_nodes.len() as u32;

        match &bvh_nodes[node_index] {
            bvh::bvh::BvhNode::Node { child_l_index, child_r_index, .. } => {
                // Placeholder until the children are known
                result_nodes.push(BvhNode::internal(Aabb::empty(), 0, 0));

                let left_index = Self::convert_node_recursive(
                    bvh_nodes,
                    *child_l_index,
                    bvh_triangles,
                    result_nodes,
                    triangle_indices,
                );
                let right_index = Self::convert_node_recursive(
                    bvh_nodes,
                    *child_r_index,
                    bvh_triangles,
                    result_nodes,
                    triangle_indices,
                );

                let bounds = Aabb::union(
                    &result_nodes[left_index as usize].bounds,
                    &result_nodes[right_index as usize].bounds,
                );
                result_nodes[current_result_index as usize] = BvhNode::internal(bounds, left_index, right_index);
            }
            bvh::bvh::BvhNode::Leaf { shape_index, .. } => {
                let triangle_start = triangle_indices.len() as u32;
                triangle_indices.push(*shape_index as u32);

                let bounds = bvh_triangles[*shape_index].triangle.bounds();
                result_nodes.push(BvhNode::leaf(bounds, triangle_start, 1));
            }
        }

        current_result_index
    }
}

/// Result of BVH construction
pub struct BvhResult {
    pub nodes: Vec<BvhNode>,
    pub triangle_indices: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn tri(v0: [f32; 3], v1: [f32; 3], v2: [f32; 3], primitive: u32) -> TriangleRecord {
        TriangleRecord::new(Vec3::from(v0), Vec3::from(v1), Vec3::from(v2), 0, primitive, 0)
    }

    #[test]
    fn test_bvh_triangle_creation() {
        let bvh_triangle = BvhTriangle::new(tri([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.5, 1.0, 0.0], 0), 0);
        assert_eq!(bvh_triangle.node_index, 0);

        let center = bvh_triangle.centroid();
        approx::assert_relative_eq!(center.x, 0.5);
        approx::assert_relative_eq!(center.y, 1.0 / 3.0);
        approx::assert_relative_eq!(center.z, 0.0);
    }

    #[test]
    fn test_bvh_triangle_bounding_box() {
        let bvh_triangle = BvhTriangle::new(tri([0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [1.0, 2.0, 0.0], 0), 0);
        let bbox = bvh_triangle.aabb();

        assert_eq!(bbox.min.coords, nalgebra::Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(bbox.max.coords, nalgebra::Vector3::new(2.0, 2.0, 0.0));
    }

    #[test]
    fn test_bvh_build_empty() {
        let result = BvhBuilder::build(&[]);

        assert_eq!(result.nodes.len(), 1);
        assert!(result.nodes[0].is_leaf());
        assert_eq!(result.nodes[0].triangle_count, 0);
        assert!(result.triangle_indices.is_empty());
    }

    #[test]
    fn test_bvh_build_single_triangle() {
        let result = BvhBuilder::build(&[tri([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.5, 1.0, 0.0], 0)]);

        assert_eq!(result.nodes.len(), 1);
        assert!(result.nodes[0].is_leaf());
        assert_eq!(result.nodes[0].triangle_count, 1);
        assert_eq!(result.triangle_indices, vec![0]);
    }

    #[test]
    fn test_bvh_build_covers_every_triangle_once() {
        let triangles: Vec<_> = (0..7)
            .map(|i| {
                let x = i as f32 * 2.0;
                tri([x, 0.0, 0.0], [x + 1.0, 0.0, 0.0], [x + 0.5, 1.0, 0.0], i)
            })
            .collect();

        let result = BvhBuilder::build(&triangles);

        assert!(result.nodes.len() <= BvhBuilder::max_nodes(triangles.len()));
        let mut indices = result.triangle_indices.clone();
        indices.sort();
        assert_eq!(indices, (0..7).collect::<Vec<u32>>());
    }

    #[test]
    fn test_bvh_parents_contain_children() {
        let triangles = vec![
            tri([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.5, 1.0, 0.0], 0),
            tri([2.0, 0.0, 0.0], [3.0, 0.0, 0.0], [2.5, 1.0, 0.0], 1),
            tri([0.0, 4.0, -2.0], [1.0, 4.0, -2.0], [0.5, 5.0, -2.0], 2),
        ];

        let result = BvhBuilder::build(&triangles);

        let root = &result.nodes[0];
        assert!(root.bounds.min[0] <= 0.0);
        assert!(root.bounds.max[0] >= 3.0);
        assert!(root.bounds.max[1] >= 5.0);
        assert!(root.bounds.min[2] <= -2.0);

        for node in result.nodes.iter().filter(|n| !n.is_leaf()) {
            assert!(node.bounds.contains(&result.nodes[node.left_child as usize].bounds));
            assert!(node.bounds.contains(&result.nodes[node.right_child as usize].bounds));
        }
    }
}
