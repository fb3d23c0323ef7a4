pub mod add_reduce_shader;
pub mod workload;
