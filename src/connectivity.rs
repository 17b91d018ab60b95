use crate::arrays::Array2D;
use assume::assume;

/// Union-find over `0..size` using Rem's splicing.
///
/// Every node points to a parent with a lower or equal index, so the root of a set is always its
/// smallest member.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parents: Vec<u32>,
}

/// Dense numbering of the sets of a [`DisjointSet`], ordered by their leaders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSet {
    pub num_components: u32,
    /// Component number of every node.
    pub component_assignment: Vec<u32>,
    pub num_component_members: Vec<u32>,
    /// Smallest node of every component.
    pub component_leaders: Vec<u32>,
}

impl DisjointSet {
    pub fn new(size: u32) -> Self {
        assert!(size < u32::MAX, "Size must be smaller than {}", u32::MAX);
        DisjointSet {
            parents: (0..size).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    #[inline]
    pub fn merge(&mut self, node_i: u32, node_j: u32) {
        let len = self.parents.len();
        let mut root_x = node_i as usize;
        let mut root_y = node_j as usize;
        let mut parent_x = self.parents[root_x];
        let mut parent_y = self.parents[root_y];
        while parent_x != parent_y {
            if parent_x > parent_y {
                assume!(unsafe: root_x < len, "root: {root_x} > {len}");
                if root_x as u32 == parent_x {
                    self.parents[root_x] = parent_y;
                    break;
                }
                let z = parent_x as usize;
                assume!(unsafe: z < len, "parent: {z} > {len}");
                parent_x = self.parents[z];
                self.parents[root_x] = parent_y;
                root_x = z;
            } else {
                assume!(unsafe: root_y < len, "root: {root_y} > {len}");
                if root_y as u32 == parent_y {
                    self.parents[root_y] = parent_x;
                    break;
                }
                let z = parent_y as usize;
                assume!(unsafe: z < len, "parent: {z} > {len}");
                parent_y = self.parents[z];
                self.parents[root_y] = parent_x;
                root_y = z;
            }
        }
    }

    /// Smallest member of the set containing `node`.
    pub fn find(&self, node: u32) -> u32 {
        let mut node = node;
        loop {
            let parent = self.parents[node as usize];
            if parent == node {
                return node;
            }
            node = parent;
        }
    }

    pub fn flatten(&self) -> ComponentSet {
        let mut result = ComponentSet {
            num_components: 0,
            component_assignment: vec![u32::MAX; self.parents.len()],
            num_component_members: vec![],
            component_leaders: vec![],
        };
        // parents[i] <= i, so a parent's component is known before its children
        for (i, &parent) in self.parents.iter().enumerate() {
            let component_no = if parent as usize == i {
                result.component_leaders.push(i as u32);
                result.num_component_members.push(0);
                result.num_components += 1;
                result.num_components - 1
            } else {
                result.component_assignment[self.find(parent) as usize]
            };
            result.component_assignment[i] = component_no;
            result.num_component_members[component_no as usize] += 1;
        }
        result
    }
}

/// Union 4-connected pixels of a `width x height` grid.
///
/// Only pixels with `mask` set take part; `joinable(a, b)` decides on two row-major indices.
pub fn assign_disjoint_set<F>(mask: &Array2D<bool>, joinable: F) -> DisjointSet
where
    F: Fn(usize, usize) -> bool,
{
    let width = mask.width;
    let mut set = DisjointSet::new(mask.len() as u32);
    for row in 0..mask.height {
        let row_mask = mask.get_row(row);
        let index_row = width * row;
        for (col, &active) in row_mask.iter().enumerate() {
            if !active {
                continue;
            }
            let index = index_row + col;
            if col > 0 && row_mask[col - 1] && joinable(index - 1, index) {
                set.merge((index - 1) as u32, index as u32);
            }
            if row > 0 && mask.data[index - width] && joinable(index - width, index) {
                set.merge((index - width) as u32, index as u32);
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_are_smallest_members() {
        let mut set = DisjointSet::new(10);
        set.merge(9, 4);
        set.merge(4, 7);
        set.merge(2, 8);
        set.merge(8, 9);
        assert_eq!(set.find(7), 2);
        assert_eq!(set.find(9), 2);
        assert_eq!(set.find(3), 3);

        let cc = set.flatten();
        // {0} {1} {2,4,7,8,9} {3} {5} {6}
        assert_eq!(cc.num_components, 6);
        assert_eq!(cc.component_leaders, vec![0, 1, 2, 3, 5, 6]);
        assert_eq!(cc.num_component_members, vec![1, 1, 5, 1, 1, 1]);
        assert_eq!(cc.component_assignment[9], 2);
        assert_eq!(cc.component_assignment[5], 4);
    }

    #[test]
    fn grid_components_respect_mask_and_predicate() {
        #[rustfmt::skip]
        let values = [
            1, 1, 2, 2,
            1, 3, 3, 2,
            1, 1, 3, 9,
        ];
        let mut mask = Array2D::from_fill(true, 4, 3);
        mask[(3, 2)] = false;
        let set = assign_disjoint_set(&mask, |a, b| values[a] == values[b]);
        let cc = set.flatten();
        // 1s, 2s, 3s and the masked pixel alone
        assert_eq!(cc.num_components, 4);
        let comp = |x: usize, y: usize| cc.component_assignment[y * 4 + x];
        assert_eq!(comp(0, 0), comp(1, 2));
        assert_eq!(comp(2, 0), comp(3, 1));
        assert_eq!(comp(1, 1), comp(2, 2));
        assert_ne!(comp(0, 0), comp(1, 1));
        assert_eq!(cc.num_component_members[comp(3, 2) as usize], 1);
    }
}
