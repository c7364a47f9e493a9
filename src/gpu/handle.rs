use slotmap::new_key_type;

// Handles are generational keys into the arenas owned by a context. A handle
// that outlives its resource fails lookup instead of aliasing a newer one.
new_key_type! {
    pub struct Buffer;
    pub struct Texture;
    pub struct Sampler;
    pub struct Shader;
    pub struct Pipeline;
    pub struct BindingLayout;
    pub struct DescriptorTable;
    pub struct Fence;
}
