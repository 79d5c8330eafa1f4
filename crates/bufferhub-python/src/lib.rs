//! Python bindings for bufferhub

use bufferhub_core::{
    BufferDesc, BufferHub as CoreHub, BufferId, BufferNode as CoreNode, BufferState, ClientBit,
    HubConfig, PixelFormat, UsageFlags,
};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

/// Convert bufferhub error to Python exception
fn to_py_err(e: bufferhub_core::Error) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn client_bit(mask: u32) -> PyResult<ClientBit> {
    ClientBit::from_mask(mask)
        .ok_or_else(|| PyValueError::new_err(format!("not a client bit: {:#x}", mask)))
}

fn state_name(state: BufferState) -> &'static str {
    match state {
        BufferState::Gained => "gained",
        BufferState::Posted => "posted",
        BufferState::Acquired => "acquired",
        BufferState::Released => "released",
    }
}

/// Python wrapper for BufferHub
#[pyclass(unsendable)]
struct BufferHub {
    inner: CoreHub,
}

#[pymethods]
impl BufferHub {
    /// Hub using `prefix` for shared memory names, or the environment
    /// settings when omitted
    #[new]
    #[pyo3(signature = (prefix=None))]
    fn new(prefix: Option<&str>) -> PyResult<Self> {
        let config = match prefix {
            Some(prefix) => HubConfig::with_prefix(prefix),
            None => HubConfig::from_env(),
        };
        let inner = CoreHub::new(config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[pyo3(signature = (width, height, layer_count=1, format=1, usage=3, user_metadata_size=0))]
    fn create_buffer(
        &self,
        width: u32,
        height: u32,
        layer_count: u32,
        format: u32,
        usage: u64,
        user_metadata_size: usize,
    ) -> PyResult<BufferNode> {
        let format = PixelFormat::from_u32(format)
            .ok_or_else(|| PyValueError::new_err(format!("unknown pixel format {:#x}", format)))?;
        let desc = BufferDesc::new(
            width,
            height,
            layer_count,
            format,
            UsageFlags::from_bits_retain(usage),
        );
        let inner = self
            .inner
            .create_buffer(desc, user_metadata_size)
            .map_err(to_py_err)?;
        Ok(BufferNode { inner })
    }

    fn attach(&self, id: u32) -> PyResult<BufferNode> {
        let id = BufferId::new(id)
            .ok_or_else(|| PyValueError::new_err("buffer id must be non-zero"))?;
        let inner = self.inner.attach(id).map_err(to_py_err)?;
        Ok(BufferNode { inner })
    }
}

/// Python wrapper for BufferNode
///
/// Client registrations are raw bit masks here: Python code is responsible
/// for removing each registered bit exactly once.
#[pyclass(unsendable)]
struct BufferNode {
    inner: CoreNode,
}

#[pymethods]
impl BufferNode {
    #[getter]
    fn id(&self) -> u32 {
        self.inner.id().get()
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    #[getter]
    fn width(&self) -> u32 {
        self.inner.buffer_desc().width
    }

    #[getter]
    fn height(&self) -> u32 {
        self.inner.buffer_desc().height
    }

    #[getter]
    fn layer_count(&self) -> u32 {
        self.inner.buffer_desc().layer_count
    }

    #[getter]
    fn format(&self) -> u32 {
        self.inner.buffer_desc().format as u32
    }

    #[getter]
    fn usage(&self) -> u64 {
        self.inner.buffer_desc().usage.bits()
    }

    #[getter]
    fn user_metadata_size(&self) -> usize {
        self.inner.user_metadata_size()
    }

    fn active_clients_bit_mask(&self) -> u32 {
        self.inner.active_clients_bit_mask()
    }

    /// Returns the new client's bit, or 0 when the buffer is full
    fn add_new_active_clients_bit_to_mask(&self) -> u32 {
        self.inner
            .add_new_active_clients_bit_to_mask()
            .map_or(0, ClientBit::mask)
    }

    fn remove_clients_bit_from_mask(&self, mask: u32) -> PyResult<()> {
        self.inner.remove_clients_bit_from_mask(client_bit(mask)?);
        Ok(())
    }

    fn buffer_state(&self) -> u32 {
        self.inner.buffer_state().load()
    }

    fn client_state(&self, mask: u32) -> PyResult<&'static str> {
        Ok(state_name(
            self.inner.buffer_state().client_state(client_bit(mask)?),
        ))
    }

    fn gain(&self, mask: u32) -> PyResult<()> {
        self.inner
            .buffer_state()
            .gain(client_bit(mask)?)
            .map_err(to_py_err)
    }

    fn post(&self, mask: u32) -> PyResult<()> {
        self.inner
            .buffer_state()
            .post(client_bit(mask)?)
            .map_err(to_py_err)
    }

    fn acquire(&self, mask: u32) -> PyResult<()> {
        self.inner
            .buffer_state()
            .acquire(client_bit(mask)?)
            .map_err(to_py_err)
    }

    fn release(&self, mask: u32) -> PyResult<()> {
        self.inner
            .buffer_state()
            .release(client_bit(mask)?)
            .map_err(to_py_err)
    }

    fn fence_state(&self) -> u32 {
        self.inner.fence_state().load()
    }

    fn set_fence_pending(&self, mask: u32) -> PyResult<bool> {
        Ok(self.inner.fence_state().set_pending(client_bit(mask)?))
    }

    fn clear_fence(&self, mask: u32) -> PyResult<bool> {
        Ok(self.inner.fence_state().clear(client_bit(mask)?))
    }
}

#[pymodule]
fn bufferhub(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<BufferHub>()?;
    m.add_class::<BufferNode>()?;
    Ok(())
}
