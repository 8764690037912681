use nalgebra::{Point3, Scalar};
use num_traits::{Bounded, Float};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

/// Scalar types usable as bounding box components.
pub trait Component: Scalar + Copy + PartialOrd + Bounded + Float {}

impl Component for f32 {}
impl Component for f64 {}

/// An axis aligned bounding box.
///
/// The bounding box is defined via a minimum and a maximum bound. No
/// assertion is made that `min <= max` holds. If the min bound is larger
/// than the max bound on any axis, the bounding box is empty.
#[derive(Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionAabb<C: Scalar> {
    min: Point3<C>,
    max: Point3<C>,
}

impl<C: Component> OptionAabb<C> {
    pub fn new(min: Point3<C>, max: Point3<C>) -> Self {
        OptionAabb { min, max }
    }

    /// Constructs an empty bounding box.
    pub fn empty() -> Self {
        let min = <C as Float>::min_value();
        let max = <C as Float>::max_value();
        OptionAabb {
            min: Point3::new(max, max, max),
            max: Point3::new(min, min, min),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn contains(&self, point: &Point3<C>) -> bool {
        self.min.x <= point.x
            && self.min.y <= point.y
            && self.min.z <= point.z
            && self.max.x >= point.x
            && self.max.y >= point.y
            && self.max.z >= point.z
    }

    /// Grow the bounding box, so that it contains the given position.
    pub fn extend(&mut self, position: &Point3<C>) {
        if self.min.x > position.x {
            self.min.x = position.x;
        }
        if self.min.y > position.y {
            self.min.y = position.y;
        }
        if self.min.z > position.z {
            self.min.z = position.z;
        }
        if self.max.x < position.x {
            self.max.x = position.x;
        }
        if self.max.y < position.y {
            self.max.y = position.y;
        }
        if self.max.z < position.z {
            self.max.z = position.z;
        }
    }

    pub fn extend_union(&mut self, other: &OptionAabb<C>) {
        if other.is_empty() {
            return;
        }
        self.extend(&other.min);
        self.extend(&other.max);
    }

    pub fn from_points<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a Point3<C>>,
        C: 'a,
    {
        let mut aabb = OptionAabb::empty();
        for p in points {
            aabb.extend(p);
        }
        aabb
    }

    /// Tries to convert this [OptionAabb] into an [Aabb].
    /// Returns None, if the bounding box is empty.
    pub fn into_aabb(self) -> Option<Aabb<C>> {
        if self.is_empty() {
            None
        } else {
            Some(Aabb { inner: self })
        }
    }
}

impl<C: Component> Default for OptionAabb<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: Component> Debug for OptionAabb<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "OptionAabb (empty)")
        } else {
            write!(
                f,
                "OptionAabb ({:?},{:?},{:?} - {:?},{:?},{:?})",
                self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
            )
        }
    }
}

/// An axis aligned bounding box, that is guaranteed to be non-empty.
#[derive(Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aabb<C: Scalar> {
    inner: OptionAabb<C>,
}

impl<C: Component> Aabb<C> {
    /// Create a new Aabb from the specified bounds.
    /// Panics, if for any component the min bound is larger than the max bound.
    pub fn new(min: Point3<C>, max: Point3<C>) -> Self {
        assert!(min.x <= max.x);
        assert!(min.y <= max.y);
        assert!(min.z <= max.z);
        Aabb {
            inner: OptionAabb::new(min, max),
        }
    }

    #[inline]
    pub fn min(&self) -> Point3<C> {
        self.inner.min
    }

    #[inline]
    pub fn max(&self) -> Point3<C> {
        self.inner.max
    }

    #[inline]
    pub fn contains(&self, point: &Point3<C>) -> bool {
        self.inner.contains(point)
    }

    pub fn contains_aabb(&self, other: &Aabb<C>) -> bool {
        self.contains(&other.min()) && self.contains(&other.max())
    }

    pub fn intersects(&self, other: &Aabb<C>) -> bool {
        if self.inner.max.x < other.inner.min.x {
            return false;
        }
        if self.inner.max.y < other.inner.min.y {
            return false;
        }
        if self.inner.max.z < other.inner.min.z {
            return false;
        }
        if self.inner.min.x > other.inner.max.x {
            return false;
        }
        if self.inner.min.y > other.inner.max.y {
            return false;
        }
        if self.inner.min.z > other.inner.max.z {
            return false;
        }
        true
    }

    pub fn extend(&mut self, position: &Point3<C>) {
        self.inner.extend(position)
    }

    pub fn extend_union(&mut self, other: &Aabb<C>) {
        self.inner.extend_union(&other.inner)
    }

    pub fn center(&self) -> Point3<C> {
        let two = C::one() + C::one();
        Point3::new(
            (self.inner.min.x + self.inner.max.x) / two,
            (self.inner.min.y + self.inner.max.y) / two,
            (self.inner.min.z + self.inner.max.z) / two,
        )
    }

    /// The eight corner points, in `x + 2y + 4z` octant order.
    pub fn corners(&self) -> [Point3<C>; 8] {
        let min = self.inner.min;
        let max = self.inner.max;
        [
            Point3::new(min.x, min.y, min.z),
            Point3::new(max.x, min.y, min.z),
            Point3::new(min.x, max.y, min.z),
            Point3::new(max.x, max.y, min.z),
            Point3::new(min.x, min.y, max.z),
            Point3::new(max.x, min.y, max.z),
            Point3::new(min.x, max.y, max.z),
            Point3::new(max.x, max.y, max.z),
        ]
    }

    /// Grows the box by `amount` in every direction.
    pub fn inflate(&self, amount: C) -> Aabb<C> {
        Aabb::new(
            Point3::new(
                self.inner.min.x - amount,
                self.inner.min.y - amount,
                self.inner.min.z - amount,
            ),
            Point3::new(
                self.inner.max.x + amount,
                self.inner.max.y + amount,
                self.inner.max.z + amount,
            ),
        )
    }

    /// Squared distance from the box to the given point; zero for contained points.
    pub fn distance_sq(&self, point: &Point3<C>) -> C {
        let mut acc = C::zero();
        for i in 0..3 {
            let d = if point[i] < self.inner.min[i] {
                self.inner.min[i] - point[i]
            } else if point[i] > self.inner.max[i] {
                point[i] - self.inner.max[i]
            } else {
                C::zero()
            };
            acc = acc + d * d;
        }
        acc
    }

    pub fn into_option(self) -> OptionAabb<C> {
        self.inner
    }
}

impl<C: Component> From<Aabb<C>> for OptionAabb<C> {
    fn from(aabb: Aabb<C>) -> Self {
        aabb.inner
    }
}

impl<C: Component> Debug for Aabb<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Aabb ({:?},{:?},{:?} - {:?},{:?},{:?})",
            self.inner.min.x,
            self.inner.min.y,
            self.inner.min.z,
            self.inner.max.x,
            self.inner.max.y,
            self.inner.max.z
        )
    }
}
